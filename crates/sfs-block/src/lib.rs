#![forbid(unsafe_code)]
//! Block I/O layer for SimpleFS.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed byte
//! device using `pread`/`pwrite`-style positioned I/O, and the `ImageDevice`
//! adapter that exposes a host file as a fixed array of 4096-byte blocks.
//!
//! There is no write cache at this layer: every `write_block` goes straight
//! to the host file, and `sync` maps to `fsync`.

use sfs_error::{Result, SfsError};
use sfs_types::{BlockNumber, BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which does not require a shared seek
/// position, so a `&self` receiver is enough for all I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing host file for read/write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) a host file of exactly `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| SfsError::InvalidArgument("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(SfsError::InvalidArgument(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| SfsError::InvalidArgument("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(SfsError::InvalidArgument(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number into a fresh buffer.
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Overwrite a block with zeros.
    fn zero_block(&self, block: BlockNumber) -> Result<()> {
        let zeros = vec![0_u8; self.block_size() as usize];
        self.write_block(block, &zeros)
    }
}

/// A byte device viewed as an array of fixed-size blocks.
#[derive(Debug, Clone)]
pub struct ImageDevice<D: ByteDevice = FileByteDevice> {
    inner: D,
    block_count: u32,
}

impl ImageDevice<FileByteDevice> {
    /// Open an existing image file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(FileByteDevice::open(path)?)
    }

    /// Create a zero-filled image of `size_bytes` (must be block-aligned).
    pub fn create(path: impl AsRef<Path>, size_bytes: u64) -> Result<Self> {
        if size_bytes == 0 || size_bytes % u64::from(BLOCK_SIZE) != 0 {
            return Err(SfsError::InvalidArgument(format!(
                "image size {size_bytes} is not a positive multiple of {BLOCK_SIZE}"
            )));
        }
        Self::new(FileByteDevice::create(path, size_bytes)?)
    }
}

impl<D: ByteDevice> ImageDevice<D> {
    /// Wrap an arbitrary byte device; its length must be block-aligned.
    pub fn new(inner: D) -> Result<Self> {
        let len = inner.len_bytes();
        if len % u64::from(BLOCK_SIZE) != 0 {
            return Err(SfsError::Corrupted(format!(
                "image length {len} is not a multiple of the block size"
            )));
        }
        let block_count = u32::try_from(len / u64::from(BLOCK_SIZE)).map_err(|_| {
            SfsError::InvalidArgument("image exceeds the 32-bit block address space".to_owned())
        })?;
        Ok(Self { inner, block_count })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn check_range(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(SfsError::InvalidArgument(format!(
                "block {block} out of range (total {})",
                self.block_count
            )));
        }
        Ok(block.byte_offset())
    }
}

impl<D: ByteDevice> BlockDevice for ImageDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let offset = self.check_range(block)?;
        let mut buf = vec![0_u8; BLOCK_SIZE as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(target: "sfs::block", event = "read", block = block.0);
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE as usize {
            return Err(SfsError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={BLOCK_SIZE}",
                data.len()
            )));
        }
        let offset = self.check_range(block)?;
        self.inner.write_all_at(offset, data)?;
        trace!(target: "sfs::block", event = "write", block = block.0);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
