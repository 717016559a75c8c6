#![forbid(unsafe_code)]
//! Block allocation for SimpleFS.
//!
//! The allocator is layered:
//!
//! 1. **Bit helpers** — raw bit manipulation on packed bitmap bytes.
//! 2. **FsGeometry** — the fixed region layout derived from the image size
//!    at format time or from the superblock at mount time.
//! 3. **BlockBitmap** — the in-memory free/allocated vector with first-fit
//!    allocation, persisted to the bitmap region as packed bytes.

use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_ondisk::Superblock;
use sfs_types::{BlockNumber, InodeNumber, BLOCK_SIZE, INODES_PER_BLOCK, JOURNAL_BLOCKS};
use tracing::{debug, trace};

/// Bits stored per bitmap block.
const BITS_PER_BLOCK: u32 = BLOCK_SIZE * 8;

// ── Bit helpers ─────────────────────────────────────────────────────────────

/// Get bit `idx` from a packed bitmap byte slice (LSB-first).
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a packed bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a packed bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count set (free) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut set = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        set += byte.count_ones();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 1 {
                set += 1;
            }
        }
    }

    set
}

/// Find the first set (free) bit in `[start, count)`.
#[must_use]
pub fn bitmap_find_set(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count).find(|&idx| bitmap_get(bitmap, idx))
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// The fixed region layout of an image, in block numbers.
///
/// Layout order is always superblock, bitmap, inode table, journal, data;
/// all boundaries are decided at format time and never move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsGeometry {
    pub total_blocks: u32,
    pub inode_count: u32,
    pub bitmap_start: u32,
    pub bitmap_blocks: u32,
    pub inode_table_start: u32,
    pub inode_table_blocks: u32,
    pub journal_start: u32,
    pub journal_blocks: u32,
    pub data_blocks_start: u32,
}

impl FsGeometry {
    /// Compute the layout for a fresh image of `total_blocks` blocks.
    ///
    /// `inode_count = total_blocks / 8` reserves ~12.5% of the image for
    /// inode metadata.
    pub fn for_total_blocks(total_blocks: u32) -> Result<Self> {
        let inode_count = total_blocks / 8;
        let bitmap_blocks = total_blocks.div_ceil(BITS_PER_BLOCK);
        let inode_table_blocks = inode_count.div_ceil(INODES_PER_BLOCK);
        let bitmap_start = 1;
        let inode_table_start = bitmap_start + bitmap_blocks;
        let journal_start = inode_table_start + inode_table_blocks;
        let data_blocks_start = journal_start + JOURNAL_BLOCKS;

        if data_blocks_start >= total_blocks {
            return Err(SfsError::InvalidArgument(format!(
                "image of {total_blocks} blocks leaves no data region \
                 (system blocks end at {data_blocks_start})"
            )));
        }

        Ok(Self {
            total_blocks,
            inode_count,
            bitmap_start,
            bitmap_blocks,
            inode_table_start,
            inode_table_blocks,
            journal_start,
            journal_blocks: JOURNAL_BLOCKS,
            data_blocks_start,
        })
    }

    /// Rehydrate the layout from a parsed superblock.
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        Self {
            total_blocks: sb.total_blocks,
            inode_count: sb.inode_count,
            bitmap_start: sb.bitmap_start,
            bitmap_blocks: sb.inode_table_start - sb.bitmap_start,
            inode_table_start: sb.inode_table_start,
            inode_table_blocks: sb.journal_start - sb.inode_table_start,
            journal_start: sb.journal_start,
            journal_blocks: sb.journal_size,
            data_blocks_start: sb.data_blocks_start,
        }
    }

    /// Blocks occupied by the superblock, bitmap, inode table, and journal.
    #[must_use]
    pub fn system_blocks(&self) -> u32 {
        self.data_blocks_start
    }

    /// Whether `block` lies in a system region (never allocatable).
    #[must_use]
    pub fn is_system_block(&self, block: BlockNumber) -> bool {
        block.0 < self.data_blocks_start
    }

    /// Whether `block` is a valid data-region block.
    #[must_use]
    pub fn is_data_block(&self, block: BlockNumber) -> bool {
        block.0 >= self.data_blocks_start && block.0 < self.total_blocks
    }

    /// Locate an inode record: the table block holding it and the byte
    /// offset of the record within that block.
    #[must_use]
    pub fn inode_location(&self, ino: InodeNumber) -> (BlockNumber, usize) {
        let block = self.inode_table_start + ino.0 / INODES_PER_BLOCK;
        let offset = (ino.0 % INODES_PER_BLOCK) as usize * sfs_types::INODE_SIZE;
        (BlockNumber(block), offset)
    }
}

// ── Superblock I/O ──────────────────────────────────────────────────────────

/// Parse the superblock from block 0.
///
/// A magic mismatch means the host file is not an image of ours.
pub fn read_superblock(dev: &dyn BlockDevice) -> Result<Superblock> {
    let block = dev.read_block(BlockNumber(0))?;
    Superblock::parse(&block).map_err(|e| SfsError::Corrupted(format!("superblock: {e}")))
}

/// Persist the superblock at the head of block 0, leaving the rest of the
/// block untouched.
pub fn write_superblock(dev: &dyn BlockDevice, sb: &Superblock) -> Result<()> {
    let mut block = dev.read_block(BlockNumber(0))?;
    let raw = sb.serialize();
    block[..raw.len()].copy_from_slice(&raw);
    dev.write_block(BlockNumber(0), &block)?;
    trace!(target: "sfs::alloc", event = "superblock_flushed", clean = sb.clean_shutdown);
    Ok(())
}

// ── Block bitmap ────────────────────────────────────────────────────────────

/// In-memory free/allocated state for every block of the image.
///
/// `bits[i] == true` means block `i` is free. The vector is loaded once at
/// mount, mutated in memory, and persisted on flush/unmount as packed
/// LSB-first bytes across the bitmap region.
#[derive(Debug, Clone)]
pub struct BlockBitmap {
    bits: Vec<bool>,
    free_blocks: u32,
    data_start: u32,
}

impl BlockBitmap {
    /// A freshly formatted bitmap: everything free except system regions.
    #[must_use]
    pub fn new_formatted(geo: &FsGeometry) -> Self {
        let mut bits = vec![true; geo.total_blocks as usize];
        for bit in bits.iter_mut().take(geo.data_blocks_start as usize) {
            *bit = false;
        }
        Self {
            bits,
            free_blocks: geo.total_blocks - geo.data_blocks_start,
            data_start: geo.data_blocks_start,
        }
    }

    /// Load the persisted bitmap region into memory.
    pub fn load(dev: &dyn BlockDevice, geo: &FsGeometry) -> Result<Self> {
        let mut bits = Vec::with_capacity(geo.total_blocks as usize);
        'outer: for i in 0..geo.bitmap_blocks {
            let block = dev.read_block(BlockNumber(geo.bitmap_start + i))?;
            for byte_idx in 0..BLOCK_SIZE as usize {
                for bit in 0..8 {
                    if bits.len() == geo.total_blocks as usize {
                        break 'outer;
                    }
                    bits.push((block[byte_idx] >> bit) & 1 == 1);
                }
            }
        }

        let free_blocks = u32::try_from(bits.iter().filter(|b| **b).count())
            .map_err(|_| SfsError::Corrupted("bitmap free count overflow".to_owned()))?;
        debug!(
            target: "sfs::alloc",
            event = "bitmap_loaded",
            total_blocks = geo.total_blocks,
            free_blocks
        );
        Ok(Self {
            bits,
            free_blocks,
            data_start: geo.data_blocks_start,
        })
    }

    /// Persist the bitmap as packed bytes across the bitmap region.
    pub fn flush(&self, dev: &dyn BlockDevice, geo: &FsGeometry) -> Result<()> {
        let mut bit_index = 0_usize;
        for i in 0..geo.bitmap_blocks {
            let mut block = vec![0_u8; BLOCK_SIZE as usize];
            for byte in block.iter_mut() {
                for bit in 0..8 {
                    if bit_index < self.bits.len() && self.bits[bit_index] {
                        *byte |= 1 << bit;
                    }
                    bit_index += 1;
                }
            }
            dev.write_block(BlockNumber(geo.bitmap_start + i), &block)?;
        }
        trace!(target: "sfs::alloc", event = "bitmap_flushed", free_blocks = self.free_blocks);
        Ok(())
    }

    /// First-fit allocation: the lowest-numbered free data block.
    pub fn allocate(&mut self) -> Result<BlockNumber> {
        for i in self.data_start..self.total_blocks() {
            if self.bits[i as usize] {
                self.bits[i as usize] = false;
                self.free_blocks -= 1;
                trace!(target: "sfs::alloc", event = "allocate", block = i);
                return Ok(BlockNumber(i));
            }
        }
        Err(SfsError::NoSpace)
    }

    /// Compact allocation used by the defragmenter.
    ///
    /// Same first-fit policy as `allocate`; kept as a named entry point so
    /// the defragmenter's placement strategy can diverge later.
    pub fn allocate_compact(&mut self) -> Result<BlockNumber> {
        self.allocate()
    }

    /// Release a data block: flip its bit and zero its contents on disk.
    ///
    /// Freeing a block that is already free is a no-op. System-region blocks
    /// are refused.
    pub fn free(&mut self, dev: &dyn BlockDevice, block: BlockNumber) -> Result<()> {
        if block.0 >= self.total_blocks() {
            return Err(SfsError::InvalidArgument(format!(
                "cannot free block {block}: out of range"
            )));
        }
        if block.0 < self.data_start {
            return Err(SfsError::InvalidArgument(format!(
                "cannot free system block {block}"
            )));
        }
        if self.bits[block.0 as usize] {
            return Ok(());
        }

        self.bits[block.0 as usize] = true;
        self.free_blocks += 1;
        dev.zero_block(block)?;
        trace!(target: "sfs::alloc", event = "free", block = block.0);
        Ok(())
    }

    #[must_use]
    pub fn is_free(&self, block: BlockNumber) -> bool {
        (block.0 as usize) < self.bits.len() && self.bits[block.0 as usize]
    }

    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        // Bit vector length is fixed at construction from a u32 block count.
        self.bits.len() as u32
    }

    /// Recount free bits; equals `free_blocks()` unless state was corrupted.
    #[must_use]
    pub fn count_free(&self) -> u32 {
        self.bits.iter().filter(|b| **b).count() as u32
    }

    /// Length of the longest run of free blocks in the data region.
    #[must_use]
    pub fn largest_free_run(&self) -> u32 {
        let mut best = 0_u32;
        let mut current = 0_u32;
        for i in self.data_start..self.total_blocks() {
            if self.bits[i as usize] {
                current += 1;
                best = best.max(current);
            } else {
                current = 0;
            }
        }
        best
    }
}
