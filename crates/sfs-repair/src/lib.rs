#![forbid(unsafe_code)]
//! Crash simulation and recovery.
//!
//! The crash simulator interrupts a write mid-flight: it leaves an inode
//! whose blocks are allocated and reachable but whose content is only a
//! prefix of what the caller intended. Recovery reconciles the bitmap with
//! inode reachability by freeing the flagged blocks, unlinking every inode
//! that referenced them, and persisting the cleaned-up metadata.
//!
//! A separate consistency audit performs the full bitmap-versus-inode scan
//! and reports orphan blocks, double-referenced blocks, and size/count
//! mismatches without modifying the image.

use serde::{Deserialize, Serialize};
use sfs_alloc::{BlockBitmap, FsGeometry};
use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{FileType, InodeRecord, Superblock};
use sfs_types::{blocks_for_bytes, BlockNumber, InodeNumber, BLOCK_SIZE};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

// ── Corruption state ────────────────────────────────────────────────────────

/// In-memory record of the last simulated crash.
///
/// Never persisted; cleared by a successful recovery.
#[derive(Debug, Clone, Default)]
pub struct CorruptionState {
    pub has_corruption: bool,
    pub corrupted_blocks: Vec<BlockNumber>,
    pub active_write_inode: Option<InodeNumber>,
}

impl CorruptionState {
    pub fn clear(&mut self) {
        self.has_corruption = false;
        self.corrupted_blocks.clear();
        self.active_write_inode = None;
    }
}

// ── Reports ─────────────────────────────────────────────────────────────────

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Inodes removed because they referenced corrupted blocks.
    pub removed_inodes: Vec<u32>,
    /// Directory entries unlinked for those inodes.
    pub removed_entries: Vec<String>,
    /// Data blocks returned to the free pool (corrupted set included).
    pub freed_blocks: u32,
}

/// Result of the read-only consistency audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Data blocks marked allocated but unreachable from any live inode.
    pub orphan_blocks: Vec<u32>,
    /// Blocks reachable from a live inode but marked free in the bitmap.
    pub missing_blocks: Vec<u32>,
    /// Blocks reachable from more than one live inode.
    pub shared_blocks: Vec<u32>,
    /// Regular inodes whose block count disagrees with their file size.
    pub invalid_inodes: Vec<u32>,
    /// Directory entries naming a free inode slot.
    pub dangling_entries: Vec<String>,
    pub root_ok: bool,
    pub errors: Vec<String>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.root_ok
            && self.orphan_blocks.is_empty()
            && self.missing_blocks.is_empty()
            && self.shared_blocks.is_empty()
            && self.invalid_inodes.is_empty()
            && self.dangling_entries.is_empty()
    }
}

// ── Crash simulation ────────────────────────────────────────────────────────

/// Interrupt a write at `crash_percent` of `full_data`.
///
/// Creates `path`, allocates only the blocks covering the written prefix,
/// wires them into the fresh inode, flushes inode and bitmap, and marks the
/// superblock dirty. The resulting image is self-inconsistent on purpose:
/// the file is reachable and its blocks are allocated, but everything past
/// the crash point is undefined.
#[allow(clippy::too_many_arguments)]
pub fn simulate_power_cut_during_write(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    sb: &mut Superblock,
    state: &mut CorruptionState,
    path: &str,
    full_data: &[u8],
    crash_percent: f64,
    now: i64,
) -> Result<InodeNumber> {
    let fraction = crash_percent.clamp(0.0, 1.0);
    // Truncation is the point: the write stops mid-way.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let crash_bytes = (full_data.len() as f64 * fraction) as usize;
    let partial_blocks = blocks_for_bytes(crash_bytes);

    let (parent_path, name) = sfs_dir::split_parent(path)?;
    let parent = sfs_dir::resolve_path(dev, geo, parent_path)?;
    if sfs_dir::lookup_entry(dev, geo, parent, name)?.is_some() {
        return Err(SfsError::AlreadyExists(path.to_owned()));
    }

    let (ino, mut record) = sfs_inode::allocate_inode(dev, geo, FileType::Regular, now)?;
    sfs_dir::add_entry(dev, geo, bitmap, parent, name, ino, FileType::Regular, now)?;

    let mut corrupted = Vec::with_capacity(partial_blocks as usize);
    for i in 0..partial_blocks as usize {
        let block = bitmap.allocate()?;
        corrupted.push(block);

        let start = i * BLOCK_SIZE as usize;
        let end = (start + BLOCK_SIZE as usize).min(crash_bytes);
        let mut payload = vec![0_u8; BLOCK_SIZE as usize];
        payload[..end - start].copy_from_slice(&full_data[start..end]);
        dev.write_block(block, &payload)?;

        sfs_inode::add_block(dev, geo, bitmap, &mut record, block)?;
    }

    record.file_size = crash_bytes as u32;
    record.modified = now;
    sfs_inode::write_inode(dev, geo, ino, &record)?;
    bitmap.flush(dev, geo)?;

    // The marker is what lets a later mount — usually a different process —
    // rebuild the corruption set and run recovery against it.
    sb.free_blocks = bitmap.free_blocks();
    sb.clean_shutdown = 0;
    sb.crashed_write_inode = Some(ino);
    sfs_alloc::write_superblock(dev, sb)?;

    state.has_corruption = true;
    state.corrupted_blocks = corrupted;
    state.active_write_inode = Some(ino);

    warn!(
        target: "sfs::repair",
        event = "power_cut_simulated",
        path,
        inode = ino.0,
        crash_bytes,
        partial_blocks,
        "write interrupted mid-flight; image is now inconsistent"
    );
    Ok(ino)
}

/// Interrupt a delete mid-flight: the directory entry disappears and the
/// inode slot is zeroed, but the file's blocks stay marked allocated.
///
/// Leaves orphan blocks for the consistency audit to find.
pub fn simulate_crash_during_delete(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    sb: &mut Superblock,
    path: &str,
    now: i64,
) -> Result<Vec<BlockNumber>> {
    let (parent_path, name) = sfs_dir::split_parent(path)?;
    let parent = sfs_dir::resolve_path(dev, geo, parent_path)?;
    let ino = sfs_dir::lookup_entry(dev, geo, parent, name)?
        .ok_or_else(|| SfsError::NotFound(path.to_owned()))?;

    let record = sfs_inode::read_inode(dev, geo, ino)?;
    let mut stranded = sfs_inode::enumerate_blocks(dev, geo, &record)?;
    if let Some(indirect) = record.indirect.get() {
        stranded.push(indirect);
    }

    // The entry and the inode go away; the bitmap never hears about it.
    sfs_dir::remove_entry(dev, geo, bitmap, parent, name, now)?;
    sfs_inode::write_inode(dev, geo, ino, &InodeRecord::free_slot())?;
    bitmap.flush(dev, geo)?;

    sb.clean_shutdown = 0;
    sfs_alloc::write_superblock(dev, sb)?;

    warn!(
        target: "sfs::repair",
        event = "delete_crash_simulated",
        path,
        inode = ino.0,
        orphaned = stranded.len(),
        "delete interrupted mid-flight; blocks orphaned"
    );
    Ok(stranded)
}

// ── Recovery ────────────────────────────────────────────────────────────────

/// Repair the image after a simulated crash.
///
/// Frees every block in the corruption set, unlinks and frees every inode
/// (root excluded) whose pointer set intersects it, persists bitmap and
/// superblock, and clears the in-memory corruption state.
pub fn run_recovery(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    sb: &mut Superblock,
    state: &mut CorruptionState,
    now: i64,
) -> Result<RecoveryReport> {
    if !state.has_corruption {
        return Ok(RecoveryReport::default());
    }

    info!(
        target: "sfs::repair",
        event = "recovery_started",
        corrupted_blocks = state.corrupted_blocks.len()
    );

    let corrupted: BTreeSet<BlockNumber> = state.corrupted_blocks.iter().copied().collect();
    let mut report = RecoveryReport::default();

    for block in &corrupted {
        bitmap.free(dev, *block)?;
        report.freed_blocks += 1;
    }

    // Root is never removed; everything else is fair game.
    let mut doomed = Vec::new();
    for (ino, record) in sfs_inode::live_inodes(dev, geo)? {
        if ino == InodeNumber::ROOT {
            continue;
        }
        let blocks = sfs_inode::enumerate_blocks(dev, geo, &record)?;
        if blocks.iter().any(|b| corrupted.contains(b)) {
            doomed.push(ino);
        }
    }

    for ino in &doomed {
        for (dir_ino, dir_record) in sfs_inode::live_inodes(dev, geo)? {
            if dir_record.file_type != FileType::Directory {
                continue;
            }
            let entries = sfs_dir::read_entries(dev, geo, &dir_record)?;
            for entry in entries.iter().filter(|e| e.inode == *ino) {
                sfs_dir::remove_entry(dev, geo, bitmap, dir_ino, &entry.name, now)?;
                report.removed_entries.push(entry.name.clone());
            }
        }

        // Remaining live blocks of the doomed inode (the corrupted set was
        // already freed; free() is idempotent for those).
        let freed = sfs_inode::free_inode(dev, geo, bitmap, *ino)?;
        report.freed_blocks += u32::try_from(freed.iter().filter(|b| !corrupted.contains(b)).count())
            .unwrap_or(0);
        report.removed_inodes.push(ino.0);
    }

    bitmap.flush(dev, geo)?;
    sb.free_blocks = bitmap.free_blocks();
    sb.free_inodes = sfs_inode::count_free_inodes(dev, geo)?;
    sb.crashed_write_inode = None;
    sfs_alloc::write_superblock(dev, sb)?;

    state.clear();
    info!(
        target: "sfs::repair",
        event = "recovery_finished",
        removed_inodes = report.removed_inodes.len(),
        freed_blocks = report.freed_blocks
    );
    Ok(report)
}

/// Rebuild the in-memory corruption state from the superblock's
/// interrupted-write marker.
///
/// The simulator wires exactly the blocks that received the partial write
/// into the marked inode, so the inode's current block list *is* the
/// corrupted set. A marker naming a freed or out-of-range inode yields an
/// empty set; recovery then has nothing to unlink but still clears the
/// marker.
pub fn corruption_state_from_image(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    sb: &Superblock,
) -> Result<CorruptionState> {
    let Some(ino) = sb.crashed_write_inode else {
        return Ok(CorruptionState::default());
    };

    let mut state = CorruptionState {
        has_corruption: true,
        corrupted_blocks: Vec::new(),
        active_write_inode: Some(ino),
    };
    if ino.0 < geo.inode_count {
        let record = sfs_inode::read_inode(dev, geo, ino)?;
        if record.is_valid() {
            state.corrupted_blocks = sfs_inode::enumerate_blocks(dev, geo, &record)?;
        }
    }

    warn!(
        target: "sfs::repair",
        event = "corruption_marker_found",
        inode = ino.0,
        corrupted_blocks = state.corrupted_blocks.len(),
        "image carries an interrupted write; recovery is pending"
    );
    Ok(state)
}

// ── Consistency audit ───────────────────────────────────────────────────────

/// Scan the whole image and reconcile bitmap state against inode
/// reachability. Read-only.
pub fn check_consistency(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &BlockBitmap,
) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport::default();
    let live = sfs_inode::live_inodes(dev, geo)?;

    // Reference counts over every reachable block, indirect blocks included.
    let mut references: BTreeMap<BlockNumber, u32> = BTreeMap::new();
    for (ino, record) in &live {
        let mut blocks = sfs_inode::enumerate_blocks(dev, geo, record)?;
        if let Some(indirect) = record.indirect.get() {
            blocks.push(indirect);
        }
        for block in blocks {
            *references.entry(block).or_default() += 1;
        }

        if record.file_type == FileType::Regular
            && record.block_count != blocks_for_bytes(record.file_size as usize)
        {
            report.invalid_inodes.push(ino.0);
            report.errors.push(format!(
                "inode {ino}: block count {} does not cover {} bytes",
                record.block_count, record.file_size
            ));
        }
    }

    for (block, count) in &references {
        if *count > 1 {
            report.shared_blocks.push(block.0);
            report
                .errors
                .push(format!("block {block} referenced by {count} inodes"));
        }
        if bitmap.is_free(*block) {
            report.missing_blocks.push(block.0);
            report
                .errors
                .push(format!("block {block} reachable but marked free"));
        }
    }

    for i in geo.data_blocks_start..geo.total_blocks {
        let block = BlockNumber(i);
        if !bitmap.is_free(block) && !references.contains_key(&block) {
            report.orphan_blocks.push(i);
        }
    }
    if !report.orphan_blocks.is_empty() {
        report
            .errors
            .push(format!("{} orphan blocks", report.orphan_blocks.len()));
    }

    // Directory entries must point at live inodes.
    for (_, record) in live.iter().filter(|(_, r)| r.file_type == FileType::Directory) {
        for entry in sfs_dir::read_entries(dev, geo, record)? {
            let target_live = entry.inode.0 < geo.inode_count
                && sfs_inode::read_inode(dev, geo, entry.inode)?.is_valid();
            if !target_live {
                report
                    .errors
                    .push(format!("entry '{}' names free inode {}", entry.name, entry.inode));
                report.dangling_entries.push(entry.name);
            }
        }
    }

    report.root_ok = matches!(
        sfs_inode::read_inode(dev, geo, InodeNumber::ROOT),
        Ok(ref r) if r.file_type == FileType::Directory
    );
    if !report.root_ok {
        report.errors.push("root directory is corrupted".to_owned());
    }

    debug!(
        target: "sfs::repair",
        event = "consistency_checked",
        consistent = report.is_consistent(),
        orphans = report.orphan_blocks.len(),
        invalid_inodes = report.invalid_inodes.len()
    );
    Ok(report)
}

/// Free every orphan block found by the audit and persist the bitmap.
pub fn repair_orphans(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    sb: &mut Superblock,
) -> Result<u32> {
    let report = check_consistency(dev, geo, bitmap)?;
    for block in &report.orphan_blocks {
        bitmap.free(dev, BlockNumber(*block))?;
    }

    bitmap.flush(dev, geo)?;
    sb.free_blocks = bitmap.free_blocks();
    sfs_alloc::write_superblock(dev, sb)?;

    let freed = u32::try_from(report.orphan_blocks.len()).unwrap_or(u32::MAX);
    if freed > 0 {
        info!(target: "sfs::repair", event = "orphans_repaired", freed);
    }
    Ok(freed)
}
