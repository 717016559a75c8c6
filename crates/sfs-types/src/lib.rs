#![forbid(unsafe_code)]
//! Core identifier types and on-disk constants for SimpleFS.
//!
//! Everything in this crate is pure data: unit-carrying newtypes that keep
//! block numbers, inode numbers, and raw pointer words from mixing, the
//! fixed geometry constants of the image format, and the little-endian
//! read/write helpers used by the serialization layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Image format constants ──────────────────────────────────────────────────

/// Block size in bytes; the only I/O granularity.
pub const BLOCK_SIZE: u32 = 4096;
/// Superblock magic at byte 0 of block 0.
pub const SUPERBLOCK_MAGIC: u32 = 0xF575_7357;
/// Serialized superblock size (45 meaningful bytes + 43 reserved).
pub const SUPERBLOCK_SIZE: usize = 88;
/// Inode record stride in the inode table.
pub const INODE_SIZE: usize = 128;
/// Inode records per table block.
pub const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_SIZE as u32;
/// Direct block pointer slots per inode.
pub const DIRECT_BLOCKS: usize = 12;
/// Pointer words in a single indirect block.
pub const INDIRECT_POINTERS: usize = (BLOCK_SIZE / 4) as usize;
/// Largest file, in blocks, an inode can address.
pub const MAX_FILE_BLOCKS: u32 = DIRECT_BLOCKS as u32 + INDIRECT_POINTERS as u32;
/// Directory entry stride.
pub const DIR_ENTRY_SIZE: usize = 64;
/// Directory entries per data block.
pub const DIR_ENTRIES_PER_BLOCK: usize = (BLOCK_SIZE as usize) / DIR_ENTRY_SIZE;
/// Longest filename storable in a directory entry.
pub const MAX_NAME_LEN: usize = 55;
/// Journal region length in blocks.
pub const JOURNAL_BLOCKS: u32 = 64;
/// Journal record stride.
pub const JOURNAL_RECORD_SIZE: usize = 256;
/// Journal records per journal block.
pub const JOURNAL_RECORDS_PER_BLOCK: usize = (BLOCK_SIZE as usize) / JOURNAL_RECORD_SIZE;
/// Default image size (100 MiB, 25 600 blocks).
pub const DEFAULT_IMAGE_BYTES: u64 = 100 * 1024 * 1024;

// ── Identifier newtypes ─────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u32);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct InodeNumber(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u32);

impl InodeNumber {
    /// The root directory.
    pub const ROOT: Self = Self(0);
}

impl BlockNumber {
    /// Byte offset of this block's first byte.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * u64::from(BLOCK_SIZE)
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Block pointers ──────────────────────────────────────────────────────────

/// A validated block pointer slot.
///
/// On disk a pointer is a signed 32-bit word where both `0` (freshly
/// formatted table) and `-1` (cleared after a rewrite) mean "no block".
/// Everything else is live only when it addresses an existing block.
/// Modeling the slot as a sum type keeps the sentinel from ever being
/// interpreted as a huge unsigned block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockPtr {
    None,
    Block(BlockNumber),
}

impl BlockPtr {
    /// Decode a raw on-disk pointer word.
    ///
    /// A word is live iff `0 < word < total_blocks`; sentinels and
    /// out-of-range values decode to `None`.
    #[must_use]
    pub fn from_raw(raw: i32, total_blocks: u32) -> Self {
        match u32::try_from(raw) {
            Ok(n) if n > 0 && n < total_blocks => Self::Block(BlockNumber(n)),
            _ => Self::None,
        }
    }

    /// Encode for disk. `None` serializes as `-1`.
    #[must_use]
    pub fn to_raw(self) -> i32 {
        match self {
            // Block numbers are bounded by the image size, far below i32::MAX.
            Self::Block(b) => i32::try_from(b.0).unwrap_or(-1),
            Self::None => -1,
        }
    }

    #[must_use]
    pub fn get(self) -> Option<BlockNumber> {
        match self {
            Self::Block(b) => Some(b),
            Self::None => None,
        }
    }

    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Block(_))
    }
}

impl Default for BlockPtr {
    fn default() -> Self {
        Self::None
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Byte-level helpers ──────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(i64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Number of blocks needed to store `bytes` bytes of payload.
#[must_use]
pub fn blocks_for_bytes(bytes: usize) -> u32 {
    let per = BLOCK_SIZE as usize;
    u32::try_from(bytes.div_ceil(per)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mut buf = [0_u8; 16];
        write_le_u32(&mut buf, 0, 0xF575_7357);
        write_le_u16(&mut buf, 4, 0xBEEF);
        write_le_i32(&mut buf, 6, -1);
        write_le_i64(&mut buf, 8, -1_234_567_890_123);

        assert_eq!(read_le_u32(&buf, 0).unwrap(), 0xF575_7357);
        assert_eq!(read_le_u16(&buf, 4).unwrap(), 0xBEEF);
        assert_eq!(read_le_i32(&buf, 6).unwrap(), -1);
        assert_eq!(read_le_i64(&buf, 8).unwrap(), -1_234_567_890_123);
    }

    #[test]
    fn ensure_slice_bounds() {
        let data = [0_u8; 8];
        assert!(ensure_slice(&data, 0, 8).is_ok());
        assert!(ensure_slice(&data, 4, 4).is_ok());
        assert_eq!(
            ensure_slice(&data, 4, 5),
            Err(ParseError::InsufficientData {
                needed: 5,
                offset: 4,
                actual: 4,
            })
        );
        assert!(ensure_slice(&data, usize::MAX, 2).is_err());
    }

    #[test]
    fn block_ptr_sentinels_decode_to_none() {
        assert_eq!(BlockPtr::from_raw(0, 25_600), BlockPtr::None);
        assert_eq!(BlockPtr::from_raw(-1, 25_600), BlockPtr::None);
        assert_eq!(BlockPtr::from_raw(i32::MIN, 25_600), BlockPtr::None);
        // Out of range for the image.
        assert_eq!(BlockPtr::from_raw(25_600, 25_600), BlockPtr::None);
        assert_eq!(BlockPtr::from_raw(i32::MAX, 25_600), BlockPtr::None);
        assert_eq!(
            BlockPtr::from_raw(42, 25_600),
            BlockPtr::Block(BlockNumber(42))
        );
    }

    #[test]
    fn block_ptr_encodes_none_as_minus_one() {
        assert_eq!(BlockPtr::None.to_raw(), -1);
        assert_eq!(BlockPtr::Block(BlockNumber(7)).to_raw(), 7);
        // Round trip through a raw word.
        let ptr = BlockPtr::from_raw(BlockPtr::None.to_raw(), 100);
        assert_eq!(ptr, BlockPtr::None);
    }

    #[test]
    fn blocks_for_bytes_rounds_up() {
        assert_eq!(blocks_for_bytes(0), 0);
        assert_eq!(blocks_for_bytes(1), 1);
        assert_eq!(blocks_for_bytes(4096), 1);
        assert_eq!(blocks_for_bytes(4097), 2);
        assert_eq!(blocks_for_bytes(12 * 4096), 12);
        assert_eq!(blocks_for_bytes(12 * 4096 + 1), 13);
    }

    #[test]
    fn geometry_constants_are_consistent() {
        assert_eq!(INODES_PER_BLOCK, 32);
        assert_eq!(DIR_ENTRIES_PER_BLOCK, 64);
        assert_eq!(JOURNAL_RECORDS_PER_BLOCK, 16);
        assert_eq!(INDIRECT_POINTERS, 1024);
        assert_eq!(MAX_FILE_BLOCKS, 1036);
    }
}
