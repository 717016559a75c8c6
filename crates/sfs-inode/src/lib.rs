#![forbid(unsafe_code)]
//! Inode management.
//!
//! Read, write, allocate, and free 128-byte inode records by index, and
//! resolve an inode's data blocks through its direct and single-indirect
//! pointers. Table blocks are read-modify-written so sibling records in the
//! same block are never disturbed.

use sfs_alloc::{BlockBitmap, FsGeometry};
use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{parse_indirect_pointers, serialize_indirect_pointers, FileType, InodeRecord};
use sfs_types::{
    BlockNumber, BlockPtr, InodeNumber, INODES_PER_BLOCK, INODE_SIZE, MAX_FILE_BLOCKS,
};
use tracing::{debug, trace};

// ── Table I/O ───────────────────────────────────────────────────────────────

/// Read and parse one inode record.
pub fn read_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    ino: InodeNumber,
) -> Result<InodeRecord> {
    if ino.0 >= geo.inode_count {
        return Err(SfsError::InvalidArgument(format!(
            "inode {ino} out of range (count {})",
            geo.inode_count
        )));
    }

    let (block, offset) = geo.inode_location(ino);
    let data = dev.read_block(block)?;
    InodeRecord::parse(&data[offset..offset + INODE_SIZE], geo.total_blocks)
        .map_err(|e| SfsError::Corrupted(format!("inode {ino}: {e}")))
}

/// Serialize an inode record and patch it into its table block.
pub fn write_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    ino: InodeNumber,
    record: &InodeRecord,
) -> Result<()> {
    if ino.0 >= geo.inode_count {
        return Err(SfsError::InvalidArgument(format!(
            "inode {ino} out of range (count {})",
            geo.inode_count
        )));
    }

    let (block, offset) = geo.inode_location(ino);
    let mut data = dev.read_block(block)?;
    data[offset..offset + INODE_SIZE].copy_from_slice(&record.serialize());
    dev.write_block(block, &data)?;
    trace!(target: "sfs::inode", event = "write", inode = ino.0);
    Ok(())
}

// ── Allocation ──────────────────────────────────────────────────────────────

/// Allocate the lowest-numbered free inode and initialize it on disk.
pub fn allocate_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    file_type: FileType,
    now: i64,
) -> Result<(InodeNumber, InodeRecord)> {
    for table_block in 0..geo.inode_table_blocks {
        let block = BlockNumber(geo.inode_table_start + table_block);
        let data = dev.read_block(block)?;

        for slot in 0..INODES_PER_BLOCK {
            let ino = InodeNumber(table_block * INODES_PER_BLOCK + slot);
            if ino.0 >= geo.inode_count {
                break;
            }
            let offset = slot as usize * INODE_SIZE;
            let record = InodeRecord::parse(&data[offset..offset + INODE_SIZE], geo.total_blocks)
                .map_err(|e| SfsError::Corrupted(format!("inode {ino}: {e}")))?;
            if record.is_free() {
                let fresh = InodeRecord::new(ino, file_type, now);
                write_inode(dev, geo, ino, &fresh)?;
                debug!(target: "sfs::inode", event = "allocate", inode = ino.0, file_type = fresh.file_type.to_raw());
                return Ok((ino, fresh));
            }
        }
    }

    Err(SfsError::NoInodes)
}

/// Release an inode: free every block it references (the indirect block
/// included), then zero its table record.
///
/// Returns the freed block numbers so the caller can clear owner-map
/// entries.
pub fn free_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    ino: InodeNumber,
) -> Result<Vec<BlockNumber>> {
    let record = read_inode(dev, geo, ino)?;
    if record.is_free() {
        return Ok(Vec::new());
    }

    let mut freed = enumerate_blocks(dev, geo, &record)?;
    if let Some(indirect) = record.indirect.get() {
        freed.push(indirect);
    }
    for block in &freed {
        bitmap.free(dev, *block)?;
    }

    write_inode(dev, geo, ino, &InodeRecord::free_slot())?;
    debug!(target: "sfs::inode", event = "free", inode = ino.0, blocks = freed.len());
    Ok(freed)
}

/// Count free inode table slots (used when persisting the superblock).
pub fn count_free_inodes(dev: &dyn BlockDevice, geo: &FsGeometry) -> Result<u32> {
    let mut free = 0_u32;
    for table_block in 0..geo.inode_table_blocks {
        let data = dev.read_block(BlockNumber(geo.inode_table_start + table_block))?;
        for slot in 0..INODES_PER_BLOCK {
            let ino = table_block * INODES_PER_BLOCK + slot;
            if ino >= geo.inode_count {
                break;
            }
            let offset = slot as usize * INODE_SIZE;
            let record = InodeRecord::parse(&data[offset..offset + INODE_SIZE], geo.total_blocks)
                .map_err(|e| SfsError::Corrupted(format!("inode {ino}: {e}")))?;
            if record.is_free() {
                free += 1;
            }
        }
    }
    Ok(free)
}

/// Collect every live inode, in index order.
pub fn live_inodes(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
) -> Result<Vec<(InodeNumber, InodeRecord)>> {
    let mut live = Vec::new();
    for table_block in 0..geo.inode_table_blocks {
        let data = dev.read_block(BlockNumber(geo.inode_table_start + table_block))?;
        for slot in 0..INODES_PER_BLOCK {
            let ino = InodeNumber(table_block * INODES_PER_BLOCK + slot);
            if ino.0 >= geo.inode_count {
                break;
            }
            let offset = slot as usize * INODE_SIZE;
            let record = InodeRecord::parse(&data[offset..offset + INODE_SIZE], geo.total_blocks)
                .map_err(|e| SfsError::Corrupted(format!("inode {ino}: {e}")))?;
            if record.is_valid() {
                live.push((ino, record));
            }
        }
    }
    Ok(live)
}

// ── Block pointer resolution ────────────────────────────────────────────────

/// Enumerate an inode's data blocks in the order the data was written.
///
/// Direct slots come first in slot order, then every live pointer of the
/// indirect block in slot order. The result is never sorted: file content
/// is reconstructed by concatenating these blocks' payloads.
pub fn enumerate_blocks(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    record: &InodeRecord,
) -> Result<Vec<BlockNumber>> {
    let mut blocks: Vec<BlockNumber> = record.direct.iter().filter_map(|p| p.get()).collect();

    if let Some(indirect) = record.indirect.get() {
        let data = dev.read_block(indirect)?;
        let pointers = parse_indirect_pointers(&data, geo.total_blocks)
            .map_err(|e| SfsError::Corrupted(format!("indirect block {indirect}: {e}")))?;
        blocks.extend(pointers.iter().filter_map(|p| p.get()));
    }

    Ok(blocks)
}

/// Wire an already-allocated data block into the next free pointer slot.
///
/// Fills direct slots first; once all twelve are live, the single indirect
/// block is allocated on demand and appended to. Increments `block_count`.
/// Returns the indirect block number when this call had to allocate it, so
/// the caller can record its ownership.
pub fn add_block(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    record: &mut InodeRecord,
    block: BlockNumber,
) -> Result<Option<BlockNumber>> {
    for slot in record.direct.iter_mut() {
        if !slot.is_live() {
            *slot = BlockPtr::Block(block);
            record.block_count += 1;
            return Ok(None);
        }
    }

    let mut newly_allocated = None;
    let indirect = match record.indirect.get() {
        Some(b) => b,
        None => {
            let b = bitmap.allocate()?;
            dev.zero_block(b)?;
            record.indirect = BlockPtr::Block(b);
            newly_allocated = Some(b);
            trace!(target: "sfs::inode", event = "indirect_allocated", inode = record.number.0, block = b.0);
            b
        }
    };

    let data = dev.read_block(indirect)?;
    let mut pointers: Vec<BlockNumber> = parse_indirect_pointers(&data, geo.total_blocks)
        .map_err(|e| SfsError::Corrupted(format!("indirect block {indirect}: {e}")))?
        .iter()
        .filter_map(|p| p.get())
        .collect();

    if pointers.len() >= sfs_types::INDIRECT_POINTERS {
        return Err(SfsError::TooLarge {
            blocks: record.block_count + 1,
            max: MAX_FILE_BLOCKS,
        });
    }

    pointers.push(block);
    dev.write_block(indirect, &serialize_indirect_pointers(&pointers))?;
    record.block_count += 1;
    Ok(newly_allocated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemBlockDevice {
        blocks: Mutex<HashMap<u32, Vec<u8>>>,
        count: u32,
    }

    impl MemBlockDevice {
        fn new(count: u32) -> Self {
            Self {
                blocks: Mutex::new(HashMap::new()),
                count,
            }
        }
    }

    impl BlockDevice for MemBlockDevice {
        fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
            let blocks = self.blocks.lock().unwrap();
            Ok(blocks
                .get(&block.0)
                .cloned()
                .unwrap_or_else(|| vec![0_u8; 4096]))
        }

        fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
            self.blocks.lock().unwrap().insert(block.0, data.to_vec());
            Ok(())
        }

        fn block_size(&self) -> u32 {
            4096
        }

        fn block_count(&self) -> u32 {
            self.count
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (MemBlockDevice, FsGeometry, BlockBitmap) {
        // 8 MiB image: 2048 blocks, 256 inodes.
        let geo = FsGeometry::for_total_blocks(2048).unwrap();
        let dev = MemBlockDevice::new(2048);
        let bitmap = BlockBitmap::new_formatted(&geo);
        (dev, geo, bitmap)
    }

    #[test]
    fn allocate_scans_lowest_free_slot() {
        let (dev, geo, _) = setup();

        let (first, rec) = allocate_inode(&dev, &geo, FileType::Directory, 100).unwrap();
        assert_eq!(first, InodeNumber(0));
        assert_eq!(rec.permissions, 0o755);
        assert_eq!(rec.link_count, 2);

        let (second, rec) = allocate_inode(&dev, &geo, FileType::Regular, 100).unwrap();
        assert_eq!(second, InodeNumber(1));
        assert_eq!(rec.permissions, 0o644);
        assert_eq!(rec.link_count, 1);
    }

    #[test]
    fn write_preserves_sibling_records() {
        let (dev, geo, _) = setup();

        let (a, _) = allocate_inode(&dev, &geo, FileType::Regular, 1).unwrap();
        let (b, _) = allocate_inode(&dev, &geo, FileType::Regular, 2).unwrap();

        let mut rec_a = read_inode(&dev, &geo, a).unwrap();
        rec_a.file_size = 9999;
        write_inode(&dev, &geo, a, &rec_a).unwrap();

        let rec_b = read_inode(&dev, &geo, b).unwrap();
        assert_eq!(rec_b.created, 2);
        assert!(rec_b.is_valid());
        assert_eq!(read_inode(&dev, &geo, a).unwrap().file_size, 9999);
    }

    #[test]
    fn exhaustion_returns_no_inodes() {
        let (dev, geo, _) = setup();
        for _ in 0..geo.inode_count {
            allocate_inode(&dev, &geo, FileType::Regular, 0).unwrap();
        }
        assert!(matches!(
            allocate_inode(&dev, &geo, FileType::Regular, 0),
            Err(SfsError::NoInodes)
        ));
        assert_eq!(count_free_inodes(&dev, &geo).unwrap(), 0);
    }

    #[test]
    fn add_block_fills_direct_then_indirect() {
        let (dev, geo, mut bitmap) = setup();
        let (ino, mut rec) = allocate_inode(&dev, &geo, FileType::Regular, 0).unwrap();

        let mut wired = Vec::new();
        for i in 0..13 {
            let block = bitmap.allocate().unwrap();
            wired.push(block);
            let new_indirect = add_block(&dev, &geo, &mut bitmap, &mut rec, block).unwrap();
            if i < 12 {
                assert_eq!(new_indirect, None);
            } else {
                // The 13th data block forces the indirect block into being.
                let indirect = new_indirect.expect("indirect block allocated");
                assert_eq!(rec.indirect.get(), Some(indirect));
            }
        }

        assert_eq!(rec.block_count, 13);
        write_inode(&dev, &geo, ino, &rec).unwrap();

        let blocks = enumerate_blocks(&dev, &geo, &rec).unwrap();
        assert_eq!(blocks, wired);
    }

    #[test]
    fn enumerate_preserves_append_order() {
        let (dev, geo, mut bitmap) = setup();
        let (_, mut rec) = allocate_inode(&dev, &geo, FileType::Regular, 0).unwrap();

        // Wire blocks out of address order: the enumeration must follow the
        // append order, not the block numbers.
        let a = bitmap.allocate().unwrap();
        let b = bitmap.allocate().unwrap();
        let c = bitmap.allocate().unwrap();
        add_block(&dev, &geo, &mut bitmap, &mut rec, c).unwrap();
        add_block(&dev, &geo, &mut bitmap, &mut rec, a).unwrap();
        add_block(&dev, &geo, &mut bitmap, &mut rec, b).unwrap();

        assert_eq!(enumerate_blocks(&dev, &geo, &rec).unwrap(), vec![c, a, b]);
    }

    #[test]
    fn free_inode_releases_blocks_and_slot() {
        let (dev, geo, mut bitmap) = setup();
        let (ino, mut rec) = allocate_inode(&dev, &geo, FileType::Regular, 0).unwrap();

        for _ in 0..14 {
            let block = bitmap.allocate().unwrap();
            add_block(&dev, &geo, &mut bitmap, &mut rec, block).unwrap();
        }
        write_inode(&dev, &geo, ino, &rec).unwrap();
        let free_before = bitmap.free_blocks();

        let freed = free_inode(&dev, &geo, &mut bitmap, ino).unwrap();
        // 14 data blocks plus the indirect block itself.
        assert_eq!(freed.len(), 15);
        assert_eq!(bitmap.free_blocks(), free_before + 15);
        assert!(read_inode(&dev, &geo, ino).unwrap().is_free());

        // Freeing a free slot is a no-op.
        assert!(free_inode(&dev, &geo, &mut bitmap, ino).unwrap().is_empty());
    }

    #[test]
    fn add_block_rejects_file_beyond_indirect_capacity() {
        let (dev, geo, mut bitmap) = setup();
        let (_, mut rec) = allocate_inode(&dev, &geo, FileType::Regular, 0).unwrap();

        for slot in rec.direct.iter_mut() {
            *slot = BlockPtr::Block(bitmap.allocate().unwrap());
        }
        // Hand-fill the indirect block to capacity.
        let indirect = bitmap.allocate().unwrap();
        rec.indirect = BlockPtr::Block(indirect);
        let full: Vec<BlockNumber> = (0..sfs_types::INDIRECT_POINTERS)
            .map(|i| BlockNumber(geo.data_blocks_start + 20 + i as u32))
            .collect();
        dev.write_block(indirect, &serialize_indirect_pointers(&full))
            .unwrap();
        rec.block_count = MAX_FILE_BLOCKS;

        let overflow = bitmap.allocate().unwrap();
        assert!(matches!(
            add_block(&dev, &geo, &mut bitmap, &mut rec, overflow),
            Err(SfsError::TooLarge { .. })
        ));
    }

    #[test]
    fn live_inode_scan_skips_free_slots() {
        let (dev, geo, mut bitmap) = setup();
        let (a, _) = allocate_inode(&dev, &geo, FileType::Directory, 0).unwrap();
        let (b, _) = allocate_inode(&dev, &geo, FileType::Regular, 0).unwrap();
        let (c, _) = allocate_inode(&dev, &geo, FileType::Regular, 0).unwrap();
        free_inode(&dev, &geo, &mut bitmap, b).unwrap();

        let live = live_inodes(&dev, &geo).unwrap();
        let numbers: Vec<InodeNumber> = live.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![a, c]);
    }
}
