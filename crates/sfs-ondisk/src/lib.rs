#![forbid(unsafe_code)]
//! On-disk format parsing for SimpleFS images.
//!
//! Pure parsing crate — no I/O, no side effects. Parses byte slices into
//! typed Rust structures representing the superblock, inode records,
//! directory entries, indirect pointer blocks, and journal records, and
//! serializes them back to their fixed little-endian layouts.

use serde::{Deserialize, Serialize};
use sfs_types::{
    BlockNumber, BlockPtr, InodeNumber, ParseError, TransactionId, BLOCK_SIZE, DIRECT_BLOCKS,
    DIR_ENTRY_SIZE, INDIRECT_POINTERS, INODE_SIZE, JOURNAL_RECORD_SIZE, MAX_NAME_LEN,
    SUPERBLOCK_MAGIC, SUPERBLOCK_SIZE, ensure_slice, read_le_i32, read_le_i64, read_le_u16,
    read_le_u32, write_le_i32, write_le_i64, write_le_u16, write_le_u32,
};

// ── Superblock ──────────────────────────────────────────────────────────────

/// Global image metadata, persisted at byte 0 of block 0.
///
/// Field order on disk: `magic, totalBlocks, freeBlocks, blockSize,
/// inodeCount, freeInodes, bitmapStart, inodeTableStart, dataBlocksStart,
/// journalStart, journalSize, cleanShutdown`, all little-endian. The first
/// five bytes of the reserved tail carry the interrupted-write marker
/// (presence flag at byte 45, inode number at bytes 46..50); the rest stays
/// zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub block_size: u32,
    pub inode_count: u32,
    pub free_inodes: u32,
    pub bitmap_start: u32,
    pub inode_table_start: u32,
    pub data_blocks_start: u32,
    pub journal_start: u32,
    pub journal_size: u32,
    /// 1 after a graceful unmount, 0 while mounted or after a crash.
    pub clean_shutdown: u8,
    /// Inode whose write was cut short by a simulated power loss.
    ///
    /// Written by the crash simulator and cleared by recovery, so a later
    /// mount — typically a different process — can rebuild the corruption
    /// set from the inode's block list and actually repair the image.
    pub crashed_write_inode: Option<InodeNumber>,
}

impl Superblock {
    /// Parse a superblock from the head of block 0.
    ///
    /// A correct magic implies the image is a valid instance; anything else
    /// is rejected before looking at the remaining fields.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(region, 0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC,
                actual: magic,
            });
        }

        let crashed_write_inode = if ensure_slice(region, 45, 1)?[0] == 1 {
            Some(InodeNumber(read_le_u32(region, 46)?))
        } else {
            None
        };

        let sb = Self {
            total_blocks: read_le_u32(region, 4)?,
            free_blocks: read_le_u32(region, 8)?,
            block_size: read_le_u32(region, 12)?,
            inode_count: read_le_u32(region, 16)?,
            free_inodes: read_le_u32(region, 20)?,
            bitmap_start: read_le_u32(region, 24)?,
            inode_table_start: read_le_u32(region, 28)?,
            data_blocks_start: read_le_u32(region, 32)?,
            journal_start: read_le_u32(region, 36)?,
            journal_size: read_le_u32(region, 40)?,
            clean_shutdown: ensure_slice(region, 44, 1)?[0],
            crashed_write_inode,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    /// Serialize to the fixed 88-byte layout.
    #[must_use]
    pub fn serialize(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0_u8; SUPERBLOCK_SIZE];
        write_le_u32(&mut buf, 0, SUPERBLOCK_MAGIC);
        write_le_u32(&mut buf, 4, self.total_blocks);
        write_le_u32(&mut buf, 8, self.free_blocks);
        write_le_u32(&mut buf, 12, self.block_size);
        write_le_u32(&mut buf, 16, self.inode_count);
        write_le_u32(&mut buf, 20, self.free_inodes);
        write_le_u32(&mut buf, 24, self.bitmap_start);
        write_le_u32(&mut buf, 28, self.inode_table_start);
        write_le_u32(&mut buf, 32, self.data_blocks_start);
        write_le_u32(&mut buf, 36, self.journal_start);
        write_le_u32(&mut buf, 40, self.journal_size);
        buf[44] = self.clean_shutdown;
        if let Some(ino) = self.crashed_write_inode {
            buf[45] = 1;
            write_le_u32(&mut buf, 46, ino.0);
        }
        buf
    }

    /// Validate basic layout sanity: region offsets must be strictly
    /// increasing and everything must fit in the image.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.block_size != BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be 4096",
            });
        }
        if self.bitmap_start == 0 || self.bitmap_start >= self.inode_table_start {
            return Err(ParseError::InvalidField {
                field: "bitmap_start",
                reason: "must lie between superblock and inode table",
            });
        }
        if self.inode_table_start >= self.journal_start {
            return Err(ParseError::InvalidField {
                field: "inode_table_start",
                reason: "inode table must precede journal",
            });
        }
        if self.journal_start + self.journal_size != self.data_blocks_start {
            return Err(ParseError::InvalidField {
                field: "journal_start",
                reason: "journal must abut data region",
            });
        }
        if self.data_blocks_start >= self.total_blocks {
            return Err(ParseError::InvalidField {
                field: "data_blocks_start",
                reason: "no data region",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn was_clean_shutdown(&self) -> bool {
        self.clean_shutdown == 1
    }
}

// ── File types ──────────────────────────────────────────────────────────────

/// Inode and directory-entry type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Free,
    Regular,
    Directory,
}

impl FileType {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Free),
            1 => Ok(Self::Regular),
            2 => Ok(Self::Directory),
            _ => Err(ParseError::InvalidField {
                field: "file_type",
                reason: "unknown tag",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Regular => 1,
            Self::Directory => 2,
        }
    }
}

// ── Inode records ───────────────────────────────────────────────────────────

/// One 128-byte inode table record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub number: InodeNumber,
    pub file_type: FileType,
    pub permissions: u16,
    pub link_count: u16,
    pub file_size: u32,
    pub block_count: u32,
    pub created: i64,
    pub modified: i64,
    pub accessed: i64,
    pub direct: [BlockPtr; DIRECT_BLOCKS],
    pub indirect: BlockPtr,
}

impl InodeRecord {
    /// A freshly initialized record for `allocate_inode`.
    ///
    /// Regular files default to mode 644, directories to 755; directories
    /// start with two links (`.` and the parent's entry).
    #[must_use]
    pub fn new(number: InodeNumber, file_type: FileType, now: i64) -> Self {
        let (permissions, link_count) = match file_type {
            FileType::Directory => (0o755, 2),
            _ => (0o644, 1),
        };
        Self {
            number,
            file_type,
            permissions,
            link_count,
            file_size: 0,
            block_count: 0,
            created: now,
            modified: now,
            accessed: now,
            direct: [BlockPtr::None; DIRECT_BLOCKS],
            indirect: BlockPtr::None,
        }
    }

    /// An all-zero free record, used to release a table slot.
    #[must_use]
    pub fn free_slot() -> Self {
        Self {
            number: InodeNumber(0),
            file_type: FileType::Free,
            permissions: 0,
            link_count: 0,
            file_size: 0,
            block_count: 0,
            created: 0,
            modified: 0,
            accessed: 0,
            direct: [BlockPtr::None; DIRECT_BLOCKS],
            indirect: BlockPtr::None,
        }
    }

    /// Parse a record from its 128-byte slot.
    ///
    /// `total_blocks` bounds pointer validation: a pointer word is live iff
    /// `0 < word < total_blocks`; the sentinels `0` and `-1` both decode to
    /// `BlockPtr::None`.
    pub fn parse(raw: &[u8], total_blocks: u32) -> Result<Self, ParseError> {
        if raw.len() < INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_SIZE,
                offset: 0,
                actual: raw.len(),
            });
        }

        let mut direct = [BlockPtr::None; DIRECT_BLOCKS];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = BlockPtr::from_raw(read_le_i32(raw, 40 + i * 4)?, total_blocks);
        }

        Ok(Self {
            number: InodeNumber(read_le_u32(raw, 0)?),
            file_type: FileType::from_raw(raw[4])?,
            permissions: u16::from(raw[5]),
            link_count: read_le_u16(raw, 6)?,
            file_size: read_le_u32(raw, 8)?,
            block_count: read_le_u32(raw, 12)?,
            created: read_le_i64(raw, 16)?,
            modified: read_le_i64(raw, 24)?,
            accessed: read_le_i64(raw, 32)?,
            direct,
            indirect: BlockPtr::from_raw(read_le_i32(raw, 88)?, total_blocks),
        })
    }

    /// Serialize to the fixed 128-byte layout.
    #[must_use]
    pub fn serialize(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0_u8; INODE_SIZE];
        write_le_u32(&mut buf, 0, self.number.0);
        buf[4] = self.file_type.to_raw();
        buf[5] = self.permissions as u8;
        write_le_u16(&mut buf, 6, self.link_count);
        write_le_u32(&mut buf, 8, self.file_size);
        write_le_u32(&mut buf, 12, self.block_count);
        write_le_i64(&mut buf, 16, self.created);
        write_le_i64(&mut buf, 24, self.modified);
        write_le_i64(&mut buf, 32, self.accessed);
        for (i, slot) in self.direct.iter().enumerate() {
            write_le_i32(&mut buf, 40 + i * 4, slot.to_raw());
        }
        write_le_i32(&mut buf, 88, self.indirect.to_raw());
        buf
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.file_type == FileType::Free
    }

    /// A record describes a live file or directory iff its type tag is set.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.file_type != FileType::Free
    }
}

// ── Indirect pointer blocks ─────────────────────────────────────────────────

/// Decode an indirect block as 1024 pointer words, preserving slot order.
pub fn parse_indirect_pointers(
    block: &[u8],
    total_blocks: u32,
) -> Result<Vec<BlockPtr>, ParseError> {
    let mut pointers = Vec::with_capacity(INDIRECT_POINTERS);
    for i in 0..INDIRECT_POINTERS {
        pointers.push(BlockPtr::from_raw(
            read_le_i32(block, i * 4)?,
            total_blocks,
        ));
    }
    Ok(pointers)
}

/// Encode a pointer list into a full block, zero-filling unused slots.
#[must_use]
pub fn serialize_indirect_pointers(pointers: &[BlockNumber]) -> Vec<u8> {
    let mut buf = vec![0_u8; BLOCK_SIZE as usize];
    for (i, block) in pointers.iter().take(INDIRECT_POINTERS).enumerate() {
        write_le_i32(&mut buf, i * 4, BlockPtr::Block(*block).to_raw());
    }
    buf
}

// ── Directory entries ───────────────────────────────────────────────────────

/// One live 64-byte directory entry.
///
/// On disk: `inodeNumber:u32 @0, nameLength:u8 @4, fileType:u8 @5,
/// padding[2] @6, filename[56] @8`. A slot is live iff `inodeNumber != 0`
/// and `nameLength != 0`; dead slots are all-zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: InodeNumber,
    pub file_type: FileType,
    pub name: String,
}

impl DirEntry {
    /// Parse one slot; `Ok(None)` means the slot is empty.
    pub fn parse(raw: &[u8]) -> Result<Option<Self>, ParseError> {
        if raw.len() < DIR_ENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: DIR_ENTRY_SIZE,
                offset: 0,
                actual: raw.len(),
            });
        }

        let inode = read_le_u32(raw, 0)?;
        let name_len = raw[4] as usize;
        if inode == 0 || name_len == 0 {
            return Ok(None);
        }
        if name_len > MAX_NAME_LEN {
            return Err(ParseError::InvalidField {
                field: "name_length",
                reason: "exceeds filename capacity",
            });
        }

        let name_bytes = &raw[8..8 + name_len];
        Ok(Some(Self {
            inode: InodeNumber(inode),
            file_type: FileType::from_raw(raw[5])?,
            name: String::from_utf8_lossy(name_bytes).into_owned(),
        }))
    }

    /// Serialize into a 64-byte slot. The caller has already validated the
    /// name length against `MAX_NAME_LEN`.
    pub fn serialize_into(&self, slot: &mut [u8]) {
        slot[..DIR_ENTRY_SIZE].fill(0);
        write_le_u32(slot, 0, self.inode.0);
        let name = self.name.as_bytes();
        let len = name.len().min(MAX_NAME_LEN);
        // Name length always fits u8 after the MAX_NAME_LEN clamp.
        slot[4] = u8::try_from(len).unwrap_or(MAX_NAME_LEN as u8);
        slot[5] = self.file_type.to_raw();
        slot[8..8 + len].copy_from_slice(&name[..len]);
    }
}

/// Decode every live entry in a directory data block, in storage order.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<DirEntry>, ParseError> {
    let mut entries = Vec::new();
    for chunk in block.chunks_exact(DIR_ENTRY_SIZE) {
        if let Some(entry) = DirEntry::parse(chunk)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

// ── Journal records ─────────────────────────────────────────────────────────

/// Operation tag for a journal transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalOp {
    CreateFile,
    DeleteFile,
    WriteData,
    UpdateInode,
    CreateDir,
    DeleteDir,
}

impl JournalOp {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(Self::CreateFile),
            2 => Ok(Self::DeleteFile),
            3 => Ok(Self::WriteData),
            4 => Ok(Self::UpdateInode),
            5 => Ok(Self::CreateDir),
            6 => Ok(Self::DeleteDir),
            _ => Err(ParseError::InvalidField {
                field: "journal_op",
                reason: "unknown opcode",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::CreateFile => 1,
            Self::DeleteFile => 2,
            Self::WriteData => 3,
            Self::UpdateInode => 4,
            Self::CreateDir => 5,
            Self::DeleteDir => 6,
        }
    }
}

/// Maximum block numbers one journal record can carry.
pub const JOURNAL_RECORD_BLOCKS: usize = 32;
/// Filename capacity of a journal record.
pub const JOURNAL_RECORD_NAME_LEN: usize = 100;

/// One 256-byte journal slot record.
///
/// A slot is live iff `transaction_id != 0`. The journal region is reserved
/// scaffolding: records are written and scanned but recovery never replays
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub transaction_id: TransactionId,
    pub op: JournalOp,
    pub committed: bool,
    pub timestamp: i64,
    pub inode: InodeNumber,
    pub parent_inode: InodeNumber,
    pub blocks: Vec<BlockNumber>,
    pub filename: String,
}

impl JournalRecord {
    /// Parse one slot; `Ok(None)` means the slot is empty.
    pub fn parse(raw: &[u8]) -> Result<Option<Self>, ParseError> {
        if raw.len() < JOURNAL_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: JOURNAL_RECORD_SIZE,
                offset: 0,
                actual: raw.len(),
            });
        }

        let transaction_id = read_le_u32(raw, 0)?;
        if transaction_id == 0 {
            return Ok(None);
        }

        let block_count = (read_le_u32(raw, 24)? as usize).min(JOURNAL_RECORD_BLOCKS);
        let mut blocks = Vec::with_capacity(block_count);
        for i in 0..block_count {
            blocks.push(BlockNumber(read_le_u32(raw, 28 + i * 4)?));
        }

        let name_raw = &raw[156..156 + JOURNAL_RECORD_NAME_LEN];
        let name_end = name_raw.iter().position(|b| *b == 0).unwrap_or(name_raw.len());

        Ok(Some(Self {
            transaction_id: TransactionId(transaction_id),
            op: JournalOp::from_raw(raw[4])?,
            committed: raw[5] == 1,
            timestamp: read_le_i64(raw, 8)?,
            inode: InodeNumber(read_le_u32(raw, 16)?),
            parent_inode: InodeNumber(read_le_u32(raw, 20)?),
            blocks,
            filename: String::from_utf8_lossy(&name_raw[..name_end]).into_owned(),
        }))
    }

    /// Serialize to the fixed 256-byte layout.
    #[must_use]
    pub fn serialize(&self) -> [u8; JOURNAL_RECORD_SIZE] {
        let mut buf = [0_u8; JOURNAL_RECORD_SIZE];
        write_le_u32(&mut buf, 0, self.transaction_id.0);
        buf[4] = self.op.to_raw();
        buf[5] = u8::from(self.committed);
        write_le_i64(&mut buf, 8, self.timestamp);
        write_le_u32(&mut buf, 16, self.inode.0);
        write_le_u32(&mut buf, 20, self.parent_inode.0);
        let count = self.blocks.len().min(JOURNAL_RECORD_BLOCKS);
        write_le_u32(&mut buf, 24, count as u32);
        for (i, block) in self.blocks.iter().take(count).enumerate() {
            write_le_u32(&mut buf, 28 + i * 4, block.0);
        }
        let name = self.filename.as_bytes();
        let len = name.len().min(JOURNAL_RECORD_NAME_LEN);
        buf[156..156 + len].copy_from_slice(&name[..len]);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblock() -> Superblock {
        // 100 MiB image: 25600 blocks, 3200 inodes.
        Superblock {
            total_blocks: 25_600,
            free_blocks: 25_433,
            block_size: 4096,
            inode_count: 3_200,
            free_inodes: 3_200,
            bitmap_start: 1,
            inode_table_start: 2,
            data_blocks_start: 166,
            journal_start: 102,
            journal_size: 64,
            clean_shutdown: 1,
            crashed_write_inode: None,
        }
    }

    #[test]
    fn superblock_round_trip() {
        let sb = sample_superblock();
        let raw = sb.serialize();
        let parsed = Superblock::parse(&raw).unwrap();
        assert_eq!(parsed, sb);
        assert!(parsed.was_clean_shutdown());
        assert_eq!(parsed.crashed_write_inode, None);
    }

    #[test]
    fn superblock_carries_interrupted_write_marker() {
        let mut sb = sample_superblock();
        sb.clean_shutdown = 0;
        sb.crashed_write_inode = Some(InodeNumber(17));

        let raw = sb.serialize();
        assert_eq!(raw[45], 1);
        let parsed = Superblock::parse(&raw).unwrap();
        assert_eq!(parsed.crashed_write_inode, Some(InodeNumber(17)));

        // A zeroed tail (any image from before a crash) parses as no marker.
        sb.crashed_write_inode = None;
        let raw = sb.serialize();
        assert!(raw[45..].iter().all(|b| *b == 0));
        assert_eq!(Superblock::parse(&raw).unwrap().crashed_write_inode, None);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut raw = sample_superblock().serialize();
        raw[0] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&raw),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_rejects_overlapping_regions() {
        let mut sb = sample_superblock();
        sb.journal_start = 90; // journal no longer abuts the data region
        let raw = sb.serialize();
        assert!(Superblock::parse(&raw).is_err());
    }

    #[test]
    fn inode_record_round_trip() {
        let mut rec = InodeRecord::new(InodeNumber(7), FileType::Regular, 1_700_000_000);
        rec.file_size = 5000;
        rec.block_count = 2;
        rec.direct[0] = BlockPtr::Block(BlockNumber(166));
        rec.direct[1] = BlockPtr::Block(BlockNumber(167));

        let raw = rec.serialize();
        let parsed = InodeRecord::parse(&raw, 25_600).unwrap();
        assert_eq!(parsed, rec);
        assert!(parsed.is_valid());
        assert_eq!(parsed.permissions, 0o644);
    }

    #[test]
    fn inode_record_treats_both_sentinels_as_no_block() {
        let mut raw = InodeRecord::new(InodeNumber(3), FileType::Regular, 0).serialize();
        // Slot 0 cleared with -1, slot 1 still zero from format time.
        write_le_i32(&mut raw, 40, -1);
        write_le_i32(&mut raw, 44, 0);
        let parsed = InodeRecord::parse(&raw, 25_600).unwrap();
        assert_eq!(parsed.direct[0], BlockPtr::None);
        assert_eq!(parsed.direct[1], BlockPtr::None);
    }

    #[test]
    fn free_slot_is_all_zero() {
        let raw = InodeRecord::free_slot().serialize();
        // Pointer slots encode None as -1; everything before them is zero.
        assert!(raw[..40].iter().all(|b| *b == 0));
        let parsed = InodeRecord::parse(&raw, 25_600).unwrap();
        assert!(parsed.is_free());
    }

    #[test]
    fn indirect_pointer_round_trip_preserves_order() {
        let blocks: Vec<BlockNumber> = (200..238).map(BlockNumber).collect();
        let raw = serialize_indirect_pointers(&blocks);
        assert_eq!(raw.len(), 4096);

        let parsed = parse_indirect_pointers(&raw, 25_600).unwrap();
        let live: Vec<BlockNumber> = parsed.iter().filter_map(|p| p.get()).collect();
        assert_eq!(live, blocks);
        // Trailing slots are sentinels.
        assert_eq!(parsed[38], BlockPtr::None);
        assert_eq!(parsed[1023], BlockPtr::None);
    }

    #[test]
    fn dir_entry_round_trip() {
        let entry = DirEntry {
            inode: InodeNumber(9),
            file_type: FileType::Regular,
            name: "report.dat".to_owned(),
        };
        let mut slot = [0_u8; DIR_ENTRY_SIZE];
        entry.serialize_into(&mut slot);
        let parsed = DirEntry::parse(&slot).unwrap().unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn dir_entry_empty_slot_parses_to_none() {
        let slot = [0_u8; DIR_ENTRY_SIZE];
        assert_eq!(DirEntry::parse(&slot).unwrap(), None);
    }

    #[test]
    fn dir_block_skips_dead_slots() {
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        let a = DirEntry {
            inode: InodeNumber(1),
            file_type: FileType::Directory,
            name: ".".to_owned(),
        };
        let b = DirEntry {
            inode: InodeNumber(5),
            file_type: FileType::Regular,
            name: "data".to_owned(),
        };
        a.serialize_into(&mut block[0..64]);
        // Slot 1 left dead.
        b.serialize_into(&mut block[128..192]);

        let entries = parse_dir_block(&block).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[1].name, "data");
    }

    #[test]
    fn journal_record_round_trip() {
        let rec = JournalRecord {
            transaction_id: TransactionId(42),
            op: JournalOp::WriteData,
            committed: false,
            timestamp: 1_700_000_123,
            inode: InodeNumber(17),
            parent_inode: InodeNumber(0),
            blocks: vec![BlockNumber(300), BlockNumber(301)],
            filename: "big.bin".to_owned(),
        };
        let raw = rec.serialize();
        let parsed = JournalRecord::parse(&raw).unwrap().unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn journal_empty_slot_parses_to_none() {
        let raw = [0_u8; JOURNAL_RECORD_SIZE];
        assert_eq!(JournalRecord::parse(&raw).unwrap(), None);
    }
}
