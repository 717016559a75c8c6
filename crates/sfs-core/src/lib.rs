#![forbid(unsafe_code)]
//! The SimpleFS engine.
//!
//! `FileSystem` owns one image: the host file handle, the in-memory bitmap,
//! the journal handle, the block-owner index, and the performance counters.
//! Every public operation is a step — after it returns, the on-disk image
//! and the in-memory state satisfy the global invariants (intermediate
//! states inside a step may not, which is exactly what the crash simulator
//! exploits).
//!
//! Access is single-threaded and exclusive: two instances over the same
//! host file produce undefined results. Mount marks the superblock dirty;
//! unmount flushes bitmap and superblock and raises the clean-shutdown
//! flag, on every exit path including drop.

use serde::{Deserialize, Serialize};
use sfs_alloc::{BlockBitmap, FsGeometry};
use sfs_block::{BlockDevice, ImageDevice};
use sfs_defrag::{BenchmarkResults, DefragReport, FragmentationReport};
use sfs_error::{Result, SfsError};
use sfs_journal::Journal;
use sfs_ondisk::{DirEntry, FileType, InodeRecord, JournalOp, JournalRecord, Superblock};
use sfs_repair::{ConsistencyReport, CorruptionState, RecoveryReport};
use sfs_types::{
    blocks_for_bytes, BlockNumber, BlockPtr, InodeNumber, TransactionId, BLOCK_SIZE,
    DEFAULT_IMAGE_BYTES, DIRECT_BLOCKS, MAX_FILE_BLOCKS,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

// ── Value types ─────────────────────────────────────────────────────────────

/// Outcome of a mount: whether the previous session shut down cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Clean,
    /// The clean-shutdown flag was down: the image is usable, but the
    /// caller should schedule a recovery pass.
    NeedsRecovery,
}

/// What a block is for, for visualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockRole {
    Superblock,
    Bitmap,
    InodeTable,
    Journal,
    FreeData,
    UsedData,
    /// Flagged by the last crash simulation.
    Corrupted,
}

/// Read/write latency and throughput counters, per instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfStats {
    pub last_read_ms: f64,
    pub last_write_ms: f64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub total_reads: u32,
    pub total_writes: u32,
}

impl PerfStats {
    fn record(&mut self, is_read: bool, elapsed_ms: f64, bytes: u64) {
        if is_read {
            self.last_read_ms = elapsed_ms;
            self.total_bytes_read += bytes;
            self.total_reads += 1;
        } else {
            self.last_write_ms = elapsed_ms;
            self.total_bytes_written += bytes;
            self.total_writes += 1;
        }
    }
}

/// Metadata view of one file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub inode: u32,
    pub file_type: FileType,
    pub permissions: u16,
    pub link_count: u16,
    pub file_size: u32,
    pub block_count: u32,
    pub created: i64,
    pub modified: i64,
    pub accessed: i64,
}

impl From<&InodeRecord> for FileInfo {
    fn from(record: &InodeRecord) -> Self {
        Self {
            inode: record.number.0,
            file_type: record.file_type,
            permissions: record.permissions,
            link_count: record.link_count,
            file_size: record.file_size,
            block_count: record.block_count,
            created: record.created,
            modified: record.modified,
            accessed: record.accessed,
        }
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

// Small deterministic generator for the fragmentation seeding helper.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

// ── FileSystem ──────────────────────────────────────────────────────────────

/// One mounted SimpleFS image.
pub struct FileSystem {
    dev: ImageDevice,
    sb: Superblock,
    geo: FsGeometry,
    bitmap: BlockBitmap,
    journal: Journal,
    owners: BTreeMap<BlockNumber, InodeNumber>,
    stats: PerfStats,
    corruption: CorruptionState,
    progress: Option<Box<dyn Fn(u8, &str)>>,
    mounted: bool,
}

impl FileSystem {
    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Format a new image at `path` and leave it mounted.
    pub fn create(path: impl AsRef<Path>, size_bytes: u64) -> Result<Self> {
        let dev = ImageDevice::create(path, size_bytes)?;
        let geo = FsGeometry::for_total_blocks(dev.block_count())?;
        let mut bitmap = BlockBitmap::new_formatted(&geo);

        // The host file is born zero-filled, so the inode table and journal
        // regions are already formatted; only the root needs seeding.
        let now = now_epoch();
        let root_blocks = sfs_dir::init_root(&dev, &geo, &mut bitmap, now)?;

        let sb = Superblock {
            total_blocks: geo.total_blocks,
            free_blocks: bitmap.free_blocks(),
            block_size: BLOCK_SIZE,
            inode_count: geo.inode_count,
            free_inodes: geo.inode_count - 1,
            bitmap_start: geo.bitmap_start,
            inode_table_start: geo.inode_table_start,
            data_blocks_start: geo.data_blocks_start,
            journal_start: geo.journal_start,
            journal_size: geo.journal_blocks,
            clean_shutdown: 1,
            crashed_write_inode: None,
        };
        sfs_alloc::write_superblock(&dev, &sb)?;
        bitmap.flush(&dev, &geo)?;
        dev.sync()?;

        let journal = Journal::open(&dev, &geo)?;
        let mut owners = BTreeMap::new();
        for block in root_blocks {
            owners.insert(block, InodeNumber::ROOT);
        }

        info!(
            target: "sfs::core",
            event = "created",
            total_blocks = geo.total_blocks,
            inode_count = geo.inode_count
        );
        Ok(Self {
            dev,
            sb,
            geo,
            bitmap,
            journal,
            owners,
            stats: PerfStats::default(),
            corruption: CorruptionState::default(),
            progress: None,
            mounted: true,
        })
    }

    /// Format a new image with the default 100 MiB size.
    pub fn create_default(path: impl AsRef<Path>) -> Result<Self> {
        Self::create(path, DEFAULT_IMAGE_BYTES)
    }

    /// Mount an existing image.
    ///
    /// A wrong magic fails with `Corrupted`. A down clean-shutdown flag
    /// does not fail: the mount succeeds with `MountStatus::NeedsRecovery`
    /// and the caller is expected to schedule `run_recovery`.
    pub fn mount(path: impl AsRef<Path>) -> Result<(Self, MountStatus)> {
        let dev = ImageDevice::open(path)?;
        let sb = sfs_alloc::read_superblock(&dev)?;
        if sb.total_blocks != dev.block_count() {
            return Err(SfsError::Corrupted(format!(
                "superblock says {} blocks but the host file holds {}",
                sb.total_blocks,
                dev.block_count()
            )));
        }

        let geo = FsGeometry::from_superblock(&sb);
        let bitmap = BlockBitmap::load(&dev, &geo)?;
        let journal = Journal::open(&dev, &geo)?;

        // A crash in a previous session leaves an interrupted-write marker
        // in the superblock; rehydrate the corruption set from it so
        // `run_recovery` has something to act on in this process.
        let corruption = sfs_repair::corruption_state_from_image(&dev, &geo, &sb)?;

        let status = if sb.was_clean_shutdown() && !corruption.has_corruption {
            MountStatus::Clean
        } else {
            warn!(
                target: "sfs::core",
                event = "unclean_shutdown",
                "image was not cleanly unmounted; recovery may be needed"
            );
            MountStatus::NeedsRecovery
        };

        let mut fs = Self {
            dev,
            sb,
            geo,
            bitmap,
            journal,
            owners: BTreeMap::new(),
            stats: PerfStats::default(),
            corruption,
            progress: None,
            mounted: true,
        };
        // Mark the image dirty for the duration of the mount.
        fs.sb.clean_shutdown = 0;
        sfs_alloc::write_superblock(&fs.dev, &fs.sb)?;
        fs.rebuild_block_ownership()?;

        info!(target: "sfs::core", event = "mounted", status = ?status);
        Ok((fs, status))
    }

    /// Flush bitmap and superblock, raise the clean flag, and detach.
    pub fn unmount(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        self.bitmap.flush(&self.dev, &self.geo)?;
        self.sb.free_blocks = self.bitmap.free_blocks();
        self.sb.free_inodes = sfs_inode::count_free_inodes(&self.dev, &self.geo)?;
        self.sb.clean_shutdown = 1;
        sfs_alloc::write_superblock(&self.dev, &self.sb)?;
        self.dev.sync()?;
        self.mounted = false;
        info!(target: "sfs::core", event = "unmounted");
        Ok(())
    }

    /// Persist bitmap and superblock without detaching.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        self.bitmap.flush(&self.dev, &self.geo)?;
        self.sb.free_blocks = self.bitmap.free_blocks();
        sfs_alloc::write_superblock(&self.dev, &self.sb)?;
        self.dev.sync()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn ensure_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(SfsError::NotMounted)
        }
    }

    // ── File operations ─────────────────────────────────────────────────────

    /// Create an empty regular file.
    pub fn create_file(&mut self, path: &str) -> Result<()> {
        self.ensure_mounted()?;
        let (parent_path, name) = sfs_dir::split_parent(path)?;
        let parent = sfs_dir::resolve_path(&self.dev, &self.geo, parent_path)?;
        if sfs_dir::lookup_entry(&self.dev, &self.geo, parent, name)?.is_some() {
            return Err(SfsError::AlreadyExists(path.to_owned()));
        }

        let now = now_epoch();
        let (ino, _) = sfs_inode::allocate_inode(&self.dev, &self.geo, FileType::Regular, now)?;
        let grown = sfs_dir::add_entry(
            &self.dev,
            &self.geo,
            &mut self.bitmap,
            parent,
            name,
            ino,
            FileType::Regular,
            now,
        )?;
        for block in grown {
            self.owners.insert(block, parent);
        }
        self.sb.free_inodes = self.sb.free_inodes.saturating_sub(1);
        debug!(target: "sfs::core", event = "create_file", path, inode = ino.0);
        Ok(())
    }

    /// Delete a regular file and release its storage.
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        self.ensure_mounted()?;
        let (parent_path, name) = sfs_dir::split_parent(path)?;
        let parent = sfs_dir::resolve_path(&self.dev, &self.geo, parent_path)?;
        let ino = sfs_dir::lookup_entry(&self.dev, &self.geo, parent, name)?
            .ok_or_else(|| SfsError::NotFound(path.to_owned()))?;
        let record = sfs_inode::read_inode(&self.dev, &self.geo, ino)?;
        if record.file_type != FileType::Regular {
            return Err(SfsError::NotRegularFile(path.to_owned()));
        }

        let freed = sfs_inode::free_inode(&self.dev, &self.geo, &mut self.bitmap, ino)?;
        for block in freed {
            self.owners.remove(&block);
        }
        sfs_dir::remove_entry(&self.dev, &self.geo, &mut self.bitmap, parent, name, now_epoch())?;
        self.sb.free_inodes = self.sb.free_inodes.saturating_add(1);
        debug!(target: "sfs::core", event = "delete_file", path, inode = ino.0);
        Ok(())
    }

    /// Read a file's full contents.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.ensure_mounted()?;
        let start = Instant::now();

        let ino = sfs_dir::resolve_path(&self.dev, &self.geo, path)?;
        let record = sfs_inode::read_inode(&self.dev, &self.geo, ino)?;
        if record.file_type != FileType::Regular {
            return Err(SfsError::NotRegularFile(path.to_owned()));
        }

        let mut data = Vec::with_capacity(record.file_size as usize);
        for block in sfs_inode::enumerate_blocks(&self.dev, &self.geo, &record)? {
            data.extend_from_slice(&self.dev.read_block(block)?);
        }
        data.truncate(record.file_size as usize);

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        self.stats.record(true, elapsed, data.len() as u64);
        Ok(data)
    }

    /// Replace a file's contents.
    ///
    /// Frees every currently live block before allocating the new set —
    /// freeing first returns those blocks to the allocator, so content that
    /// fits in the same footprint reuses the same low addresses. This
    /// free-then-allocate order is what lets defragmentation converge.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.ensure_mounted()?;
        let start = Instant::now();

        let ino = sfs_dir::resolve_path(&self.dev, &self.geo, path)?;
        let mut record = sfs_inode::read_inode(&self.dev, &self.geo, ino)?;
        if record.file_type != FileType::Regular {
            return Err(SfsError::NotRegularFile(path.to_owned()));
        }

        let needed = blocks_for_bytes(data.len());
        if needed > MAX_FILE_BLOCKS {
            return Err(SfsError::TooLarge {
                blocks: needed,
                max: MAX_FILE_BLOCKS,
            });
        }

        let mut old = sfs_inode::enumerate_blocks(&self.dev, &self.geo, &record)?;
        if let Some(indirect) = record.indirect.get() {
            old.push(indirect);
        }
        for block in &old {
            self.bitmap.free(&self.dev, *block)?;
            self.owners.remove(block);
        }
        record.direct = [BlockPtr::None; DIRECT_BLOCKS];
        record.indirect = BlockPtr::None;
        record.block_count = 0;

        for (i, chunk) in data.chunks(BLOCK_SIZE as usize).enumerate() {
            debug_assert!(i < needed as usize);
            let block = self.bitmap.allocate()?;
            let mut payload = vec![0_u8; BLOCK_SIZE as usize];
            payload[..chunk.len()].copy_from_slice(chunk);
            self.dev.write_block(block, &payload)?;
            if let Some(indirect) = sfs_inode::add_block(
                &self.dev,
                &self.geo,
                &mut self.bitmap,
                &mut record,
                block,
            )? {
                self.owners.insert(indirect, ino);
            }
            self.owners.insert(block, ino);
        }

        record.file_size = data.len() as u32;
        record.modified = now_epoch();
        sfs_inode::write_inode(&self.dev, &self.geo, ino, &record)?;

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        self.stats.record(false, elapsed, data.len() as u64);
        debug!(target: "sfs::core", event = "write_file", path, bytes = data.len(), blocks = needed);
        Ok(())
    }

    /// Whether a path resolves at all.
    pub fn file_exists(&self, path: &str) -> bool {
        self.mounted && sfs_dir::resolve_path(&self.dev, &self.geo, path).is_ok()
    }

    /// Metadata for one path.
    pub fn get_file_info(&self, path: &str) -> Result<FileInfo> {
        self.ensure_mounted()?;
        let ino = sfs_dir::resolve_path(&self.dev, &self.geo, path)?;
        let record = sfs_inode::read_inode(&self.dev, &self.geo, ino)?;
        Ok(FileInfo::from(&record))
    }

    /// File size in bytes.
    pub fn get_file_size(&self, path: &str) -> Result<u64> {
        Ok(u64::from(self.get_file_info(path)?.file_size))
    }

    // ── Directory operations ────────────────────────────────────────────────

    /// Create a directory (the parent must already exist).
    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        self.ensure_mounted()?;
        let (parent_path, name) = sfs_dir::split_parent(path)?;
        let parent = sfs_dir::resolve_path(&self.dev, &self.geo, parent_path)?;

        let created = sfs_dir::create_directory(
            &self.dev,
            &self.geo,
            &mut self.bitmap,
            name,
            parent,
            now_epoch(),
        )?;
        for block in created.own_blocks {
            self.owners.insert(block, created.inode);
        }
        for block in created.parent_blocks {
            self.owners.insert(block, parent);
        }
        self.sb.free_inodes = self.sb.free_inodes.saturating_sub(1);
        debug!(target: "sfs::core", event = "create_dir", path, inode = created.inode.0);
        Ok(())
    }

    /// Delete an empty directory. The root and non-empty directories are
    /// refused with `InvalidArgument`.
    pub fn delete_dir(&mut self, path: &str) -> Result<()> {
        self.ensure_mounted()?;
        let (parent_path, name) = sfs_dir::split_parent(path)?;
        let parent = sfs_dir::resolve_path(&self.dev, &self.geo, parent_path)?;
        let ino = sfs_dir::lookup_entry(&self.dev, &self.geo, parent, name)?
            .ok_or_else(|| SfsError::NotFound(path.to_owned()))?;
        if ino == InodeNumber::ROOT {
            return Err(SfsError::InvalidArgument(
                "cannot delete the root directory".to_owned(),
            ));
        }

        let entries = sfs_dir::list_directory(&self.dev, &self.geo, ino)?;
        if entries.iter().any(|e| e.name != "." && e.name != "..") {
            return Err(SfsError::InvalidArgument(format!(
                "directory '{path}' is not empty"
            )));
        }

        let freed = sfs_inode::free_inode(&self.dev, &self.geo, &mut self.bitmap, ino)?;
        for block in freed {
            self.owners.remove(&block);
        }
        sfs_dir::remove_entry(&self.dev, &self.geo, &mut self.bitmap, parent, name, now_epoch())?;
        self.sb.free_inodes = self.sb.free_inodes.saturating_add(1);
        debug!(target: "sfs::core", event = "delete_dir", path, inode = ino.0);
        Ok(())
    }

    /// List a directory's entries, `.` and `..` included.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.ensure_mounted()?;
        let ino = sfs_dir::resolve_path(&self.dev, &self.geo, path)?;
        sfs_dir::list_directory(&self.dev, &self.geo, ino)
    }

    // ── Statistics ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.geo.total_blocks
    }

    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.bitmap.free_blocks()
    }

    #[must_use]
    pub fn used_blocks(&self) -> u32 {
        self.geo.total_blocks - self.bitmap.free_blocks()
    }

    #[must_use]
    pub fn free_inodes(&self) -> u32 {
        self.sb.free_inodes
    }

    #[must_use]
    pub fn stats(&self) -> &PerfStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = PerfStats::default();
    }

    /// The aggregate fragmentation score in `[0, 100]`.
    pub fn fragmentation_score(&self) -> Result<f64> {
        Ok(self.analyze_fragmentation()?.fragmentation_score)
    }

    // ── Block ownership and roles ───────────────────────────────────────────

    pub fn set_block_owner(&mut self, block: BlockNumber, inode: InodeNumber) {
        self.owners.insert(block, inode);
    }

    pub fn clear_block_owner(&mut self, block: BlockNumber) {
        self.owners.remove(&block);
    }

    #[must_use]
    pub fn get_block_owner(&self, block: BlockNumber) -> Option<InodeNumber> {
        self.owners.get(&block).copied()
    }

    /// Rebuild the owner index by scanning every live inode: each data
    /// block, each live indirect pointer target, and the indirect block
    /// itself all map to the owning inode.
    pub fn rebuild_block_ownership(&mut self) -> Result<()> {
        self.owners.clear();
        for (ino, record) in sfs_inode::live_inodes(&self.dev, &self.geo)? {
            for block in sfs_inode::enumerate_blocks(&self.dev, &self.geo, &record)? {
                self.owners.insert(block, ino);
            }
            if let Some(indirect) = record.indirect.get() {
                self.owners.insert(indirect, ino);
            }
        }
        debug!(
            target: "sfs::core",
            event = "ownership_rebuilt",
            owned_blocks = self.owners.len()
        );
        Ok(())
    }

    /// Reverse-lookup a name for an inode by scanning directory entries.
    /// Returns an empty string when nothing references it.
    pub fn filename_from_inode(&self, inode: InodeNumber) -> Result<String> {
        self.ensure_mounted()?;
        for (_, record) in sfs_inode::live_inodes(&self.dev, &self.geo)? {
            if record.file_type != FileType::Directory {
                continue;
            }
            for entry in sfs_dir::read_entries(&self.dev, &self.geo, &record)? {
                if entry.inode == inode && entry.name != "." && entry.name != ".." {
                    return Ok(entry.name);
                }
            }
        }
        Ok(String::new())
    }

    /// Classify one block for visualization.
    pub fn block_role(&self, block: BlockNumber) -> Result<BlockRole> {
        if block.0 >= self.geo.total_blocks {
            return Err(SfsError::InvalidArgument(format!(
                "block {block} out of range"
            )));
        }
        if self.corruption.corrupted_blocks.contains(&block) {
            return Ok(BlockRole::Corrupted);
        }
        Ok(if block.0 == 0 {
            BlockRole::Superblock
        } else if block.0 < self.geo.inode_table_start {
            BlockRole::Bitmap
        } else if block.0 < self.geo.journal_start {
            BlockRole::InodeTable
        } else if block.0 < self.geo.data_blocks_start {
            BlockRole::Journal
        } else if self.bitmap.is_free(block) {
            BlockRole::FreeData
        } else {
            BlockRole::UsedData
        })
    }

    // ── Corruption and recovery ─────────────────────────────────────────────

    #[must_use]
    pub fn has_corruption(&self) -> bool {
        self.corruption.has_corruption
    }

    #[must_use]
    pub fn corrupted_blocks(&self) -> &[BlockNumber] {
        &self.corruption.corrupted_blocks
    }

    #[must_use]
    pub fn active_write_inode(&self) -> Option<InodeNumber> {
        self.corruption.active_write_inode
    }

    /// Interrupt a write to `path` at `crash_percent` of `full_data`,
    /// leaving the image inconsistent and the superblock dirty.
    pub fn simulate_power_cut_during_write(
        &mut self,
        path: &str,
        full_data: &[u8],
        crash_percent: f64,
    ) -> Result<InodeNumber> {
        self.ensure_mounted()?;
        let ino = sfs_repair::simulate_power_cut_during_write(
            &self.dev,
            &self.geo,
            &mut self.bitmap,
            &mut self.sb,
            &mut self.corruption,
            path,
            full_data,
            crash_percent,
            now_epoch(),
        )?;
        self.sb.free_inodes = self.sb.free_inodes.saturating_sub(1);
        for block in &self.corruption.corrupted_blocks {
            self.owners.insert(*block, ino);
        }
        Ok(ino)
    }

    /// Interrupt a delete of `path`, stranding its blocks as orphans.
    pub fn simulate_crash_during_delete(&mut self, path: &str) -> Result<Vec<BlockNumber>> {
        self.ensure_mounted()?;
        let stranded = sfs_repair::simulate_crash_during_delete(
            &self.dev,
            &self.geo,
            &mut self.bitmap,
            &mut self.sb,
            path,
            now_epoch(),
        )?;
        self.sb.free_inodes = self.sb.free_inodes.saturating_add(1);
        for block in &stranded {
            self.owners.remove(block);
        }
        Ok(stranded)
    }

    /// Repair the image after a simulated crash and clear the corruption
    /// state. A no-op when nothing is flagged.
    pub fn run_recovery(&mut self) -> Result<RecoveryReport> {
        self.ensure_mounted()?;
        let report = sfs_repair::run_recovery(
            &self.dev,
            &self.geo,
            &mut self.bitmap,
            &mut self.sb,
            &mut self.corruption,
            now_epoch(),
        )?;
        self.rebuild_block_ownership()?;
        Ok(report)
    }

    /// Read-only full-image consistency audit.
    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        self.ensure_mounted()?;
        sfs_repair::check_consistency(&self.dev, &self.geo, &self.bitmap)
    }

    /// Free orphaned data blocks found by the audit.
    pub fn repair_orphans(&mut self) -> Result<u32> {
        self.ensure_mounted()?;
        sfs_repair::repair_orphans(&self.dev, &self.geo, &mut self.bitmap, &mut self.sb)
    }

    // ── Fragmentation and defragmentation ───────────────────────────────────

    /// Per-file run analysis and the aggregate score.
    pub fn analyze_fragmentation(&self) -> Result<FragmentationReport> {
        self.ensure_mounted()?;
        sfs_defrag::analyze_fragmentation(&self.dev, &self.geo, &self.bitmap)
    }

    /// Whole-image defragmentation with before/after benchmarks.
    ///
    /// `cancelled` is checked between files; see `sfs_defrag` for the exact
    /// cancellation semantics.
    pub fn defragment_file_system(&mut self, cancelled: &AtomicBool) -> Result<DefragReport> {
        self.ensure_mounted()?;
        let report = sfs_defrag::defragment_file_system(
            &self.dev,
            &self.geo,
            &mut self.bitmap,
            &mut self.sb,
            cancelled,
            self.progress.as_deref(),
        )?;
        self.rebuild_block_ownership()?;
        Ok(report)
    }

    /// Rewrite one file through free-then-allocate.
    pub fn defragment_file(&mut self, inode: InodeNumber) -> Result<bool> {
        self.ensure_mounted()?;
        let rewritten = sfs_defrag::defragment_file(&self.dev, &self.geo, &mut self.bitmap, inode)?;
        if rewritten {
            self.rebuild_block_ownership()?;
        }
        Ok(rewritten)
    }

    /// Average end-to-end read latency over up to `sample` files.
    pub fn run_benchmark(&self, sample: u32) -> Result<BenchmarkResults> {
        self.ensure_mounted()?;
        sfs_defrag::run_benchmark(&self.dev, &self.geo, sample)
    }

    /// Seed the image with an interleaved create/delete/create workload to
    /// produce measurable fragmentation.
    pub fn simulate_fragmentation(&mut self, files: u32) -> Result<()> {
        self.ensure_mounted()?;
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15 ^ u64::from(files.max(1)));

        for i in 0..files {
            let path = format!("/testfile_{i}.dat");
            self.create_file(&path)?;
            let size = 1024 + (rng.next() % (15 * 1024)) as usize;
            let mut data = vec![0_u8; size];
            for byte in data.iter_mut() {
                *byte = (rng.next() & 0xFF) as u8;
            }
            self.write_file(&path, &data)?;
        }

        // Delete every other file to punch holes, then write files that
        // have to fall into them.
        for i in (0..files).step_by(2) {
            self.delete_file(&format!("/testfile_{i}.dat"))?;
        }
        for i in files..files + files / 2 {
            let path = format!("/fragmented_{i}.dat");
            self.create_file(&path)?;
            let size = 1024 + (rng.next() % (15 * 1024)) as usize;
            let mut data = vec![0_u8; size];
            for byte in data.iter_mut() {
                *byte = (rng.next() & 0xFF) as u8;
            }
            self.write_file(&path, &data)?;
        }

        info!(target: "sfs::core", event = "fragmentation_seeded", files);
        Ok(())
    }

    /// Install the progress observer invoked between defragmentation unit
    /// steps.
    pub fn set_progress_callback(&mut self, callback: impl Fn(u8, &str) + 'static) {
        self.progress = Some(Box::new(callback));
    }

    // ── Journal passthrough ─────────────────────────────────────────────────

    /// Record the start of a transaction in the journal region.
    ///
    /// The journal is audit-only scaffolding: recovery never replays it.
    pub fn journal_begin(
        &mut self,
        op: JournalOp,
        inode: InodeNumber,
        parent: InodeNumber,
        filename: &str,
    ) -> Result<TransactionId> {
        self.ensure_mounted()?;
        self.journal
            .begin_transaction(&self.dev, op, inode, parent, filename, now_epoch())
    }

    pub fn journal_commit(&mut self, id: TransactionId) -> Result<()> {
        self.ensure_mounted()?;
        self.journal.commit_transaction(&self.dev, id)
    }

    pub fn journal_abort(&mut self, id: TransactionId) -> Result<()> {
        self.ensure_mounted()?;
        self.journal.abort_transaction(&self.dev, id)
    }

    pub fn journal_add_block(&mut self, id: TransactionId, block: BlockNumber) -> Result<()> {
        self.ensure_mounted()?;
        self.journal.add_block_to_transaction(&self.dev, id, block)
    }

    pub fn journal_uncommitted(&self) -> Result<Vec<JournalRecord>> {
        self.ensure_mounted()?;
        self.journal.uncommitted_transactions(&self.dev)
    }

    pub fn journal_clear(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        self.journal.clear(&self.dev)
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        // Last-resort flush so an early return or panic unwind still leaves
        // a clean image. Errors cannot be reported from here.
        if self.mounted {
            let _ = self.unmount();
        }
    }
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("total_blocks", &self.geo.total_blocks)
            .field("free_blocks", &self.bitmap.free_blocks())
            .field("mounted", &self.mounted)
            .field("has_corruption", &self.corruption.has_corruption)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_unmount_mount_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut fs = FileSystem::create(&path, 8 * 1024 * 1024).unwrap();
        assert!(fs.is_mounted());
        fs.create_file("/hello").unwrap();
        fs.write_file("/hello", b"world").unwrap();
        fs.unmount().unwrap();
        assert!(!fs.is_mounted());
        assert!(matches!(fs.read_file("/hello"), Err(SfsError::NotMounted)));
        drop(fs);

        let (mut fs, status) = FileSystem::mount(&path).unwrap();
        assert_eq!(status, MountStatus::Clean);
        assert_eq!(fs.read_file("/hello").unwrap(), b"world");
    }

    #[test]
    fn mount_rejects_garbage_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.img");
        std::fs::write(&path, vec![0xAA_u8; 64 * 4096]).unwrap();

        assert!(matches!(
            FileSystem::mount(&path),
            Err(SfsError::Corrupted(_))
        ));
    }

    #[test]
    fn drop_flushes_clean_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        {
            let mut fs = FileSystem::create(&path, 8 * 1024 * 1024).unwrap();
            fs.create_file("/persisted").unwrap();
            fs.write_file("/persisted", &[5_u8; 10_000]).unwrap();
            // No explicit unmount: Drop must flush.
        }

        let (fs, status) = FileSystem::mount(&path).unwrap();
        assert_eq!(status, MountStatus::Clean);
        assert!(fs.file_exists("/persisted"));
    }

    #[test]
    fn perf_stats_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::create(&path, 8 * 1024 * 1024).unwrap();

        fs.create_file("/a").unwrap();
        fs.write_file("/a", &[1_u8; 9000]).unwrap();
        let _ = fs.read_file("/a").unwrap();

        let stats = fs.stats();
        assert_eq!(stats.total_writes, 1);
        assert_eq!(stats.total_reads, 1);
        assert_eq!(stats.total_bytes_written, 9000);
        assert_eq!(stats.total_bytes_read, 9000);

        fs.reset_stats();
        assert_eq!(fs.stats().total_reads, 0);
    }

    #[test]
    fn block_roles_cover_the_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::create(&path, 8 * 1024 * 1024).unwrap();

        assert_eq!(fs.block_role(BlockNumber(0)).unwrap(), BlockRole::Superblock);
        assert_eq!(
            fs.block_role(BlockNumber(fs.geo.bitmap_start)).unwrap(),
            BlockRole::Bitmap
        );
        assert_eq!(
            fs.block_role(BlockNumber(fs.geo.inode_table_start)).unwrap(),
            BlockRole::InodeTable
        );
        assert_eq!(
            fs.block_role(BlockNumber(fs.geo.journal_start)).unwrap(),
            BlockRole::Journal
        );
        // Root directory occupies the first data block.
        assert_eq!(
            fs.block_role(BlockNumber(fs.geo.data_blocks_start)).unwrap(),
            BlockRole::UsedData
        );
        assert_eq!(
            fs.block_role(BlockNumber(fs.geo.data_blocks_start + 1)).unwrap(),
            BlockRole::FreeData
        );
        assert!(fs.block_role(BlockNumber(fs.geo.total_blocks)).is_err());

        fs.create_file("/f").unwrap();
        fs.write_file("/f", &[1_u8; 4096]).unwrap();
        assert_eq!(
            fs.block_role(BlockNumber(fs.geo.data_blocks_start + 1)).unwrap(),
            BlockRole::UsedData
        );
    }

    #[test]
    fn owner_index_tracks_writes_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::create(&path, 8 * 1024 * 1024).unwrap();

        fs.create_file("/owned").unwrap();
        fs.write_file("/owned", &[9_u8; 8192]).unwrap();
        let info = fs.get_file_info("/owned").unwrap();
        let first_data = BlockNumber(fs.geo.data_blocks_start + 1);
        assert_eq!(fs.get_block_owner(first_data), Some(InodeNumber(info.inode)));

        // Rebuild agrees with incremental tracking.
        let incremental = fs.owners.clone();
        fs.rebuild_block_ownership().unwrap();
        assert_eq!(fs.owners, incremental);

        fs.delete_file("/owned").unwrap();
        assert_eq!(fs.get_block_owner(first_data), None);
    }

    #[test]
    fn filename_reverse_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::create(&path, 8 * 1024 * 1024).unwrap();

        fs.create_dir("/docs").unwrap();
        fs.create_file("/docs/note.txt").unwrap();
        let info = fs.get_file_info("/docs/note.txt").unwrap();

        assert_eq!(
            fs.filename_from_inode(InodeNumber(info.inode)).unwrap(),
            "note.txt"
        );
        assert_eq!(fs.filename_from_inode(InodeNumber(999)).unwrap(), "");
    }

    #[test]
    fn journal_passthrough_records_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::create(&path, 8 * 1024 * 1024).unwrap();

        let txn = fs
            .journal_begin(JournalOp::WriteData, InodeNumber(1), InodeNumber::ROOT, "f")
            .unwrap();
        fs.journal_add_block(txn, BlockNumber(200)).unwrap();
        assert_eq!(fs.journal_uncommitted().unwrap().len(), 1);

        fs.journal_commit(txn).unwrap();
        assert!(fs.journal_uncommitted().unwrap().is_empty());
        fs.journal_clear().unwrap();
    }
}
