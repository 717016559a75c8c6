#![forbid(unsafe_code)]
//! Fragmentation analysis and defragmentation.
//!
//! The analyser counts, per regular file, the number of maximal contiguous
//! runs its sorted block list falls into and aggregates an image-wide score.
//! The defragmenter performs a whole-image pass: collect every file's
//! content, release all of their blocks at once, then reallocate with the
//! first-fit allocator in inode order — because every file is freed before
//! any is reallocated, first-fit packs each file into a single run at the
//! low end of the data region.
//!
//! Read-latency micro-benchmarks run before and after the pass to report
//! the improvement.

use serde::{Deserialize, Serialize};
use sfs_alloc::{BlockBitmap, FsGeometry};
use sfs_block::BlockDevice;
use sfs_error::Result;
use sfs_ondisk::{FileType, InodeRecord, Superblock};
use sfs_types::{blocks_for_bytes, BlockNumber, BlockPtr, InodeNumber, BLOCK_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Progress observer invoked between unit steps: `(percent, message)`.
pub type ProgressFn = dyn Fn(u8, &str);

// ── Run counting ────────────────────────────────────────────────────────────

/// Count maximal contiguous runs in a file's block list.
///
/// The list is sorted first — run counting is about placement, unlike
/// enumeration for reads, which must never sort.
#[must_use]
pub fn count_runs(blocks: &[BlockNumber]) -> u32 {
    if blocks.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u32> = blocks.iter().map(|b| b.0).collect();
    sorted.sort_unstable();

    let mut runs = 1_u32;
    for pair in sorted.windows(2) {
        if pair[1] != pair[0] + 1 {
            runs += 1;
        }
    }
    runs
}

// ── Analysis ────────────────────────────────────────────────────────────────

/// Image-wide fragmentation summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentationReport {
    /// Regular files with at least one block.
    pub total_files: u32,
    /// Files stored in more than one run.
    pub fragmented_files: u32,
    /// Sum of runs across analysed files.
    pub total_fragments: u32,
    /// Average runs per file (1.0 when every file is contiguous).
    pub average_fragments_per_file: f64,
    /// `clamp(0, 100, (average − 1) × 20)`: 0 when every file is one run,
    /// 100 when the average file is in six or more pieces.
    pub fragmentation_score: f64,
    /// Longest run of free blocks in the data region.
    pub largest_contiguous_free_region: u32,
}

/// Analyse every live regular file with nonzero size.
pub fn analyze_fragmentation(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &BlockBitmap,
) -> Result<FragmentationReport> {
    let mut report = FragmentationReport {
        largest_contiguous_free_region: bitmap.largest_free_run(),
        ..FragmentationReport::default()
    };

    for (_, record) in sfs_inode::live_inodes(dev, geo)? {
        if record.file_type != FileType::Regular || record.file_size == 0 {
            continue;
        }
        let blocks = sfs_inode::enumerate_blocks(dev, geo, &record)?;
        let runs = count_runs(&blocks);
        report.total_files += 1;
        report.total_fragments += runs;
        if runs > 1 {
            report.fragmented_files += 1;
        }
    }

    if report.total_files > 0 {
        report.average_fragments_per_file =
            f64::from(report.total_fragments) / f64::from(report.total_files);
        report.fragmentation_score =
            ((report.average_fragments_per_file - 1.0) * 20.0).clamp(0.0, 100.0);
    }

    debug!(
        target: "sfs::defrag",
        event = "analyzed",
        total_files = report.total_files,
        fragmented_files = report.fragmented_files,
        score = report.fragmentation_score
    );
    Ok(report)
}

// ── Benchmark ───────────────────────────────────────────────────────────────

/// Average end-to-end read latency over a sample of files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResults {
    pub avg_read_ms: f64,
    pub files_sampled: u32,
}

/// Read up to `sample` regular files end-to-end and average the wall-clock
/// latency.
pub fn run_benchmark(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    sample: u32,
) -> Result<BenchmarkResults> {
    let mut sampled = 0_u32;
    let mut total_ms = 0.0_f64;

    for (_, record) in sfs_inode::live_inodes(dev, geo)? {
        if sampled >= sample {
            break;
        }
        if record.file_type != FileType::Regular || record.block_count == 0 {
            continue;
        }

        let start = Instant::now();
        for block in sfs_inode::enumerate_blocks(dev, geo, &record)? {
            let _ = dev.read_block(block)?;
        }
        total_ms += start.elapsed().as_secs_f64() * 1000.0;
        sampled += 1;
    }

    Ok(BenchmarkResults {
        avg_read_ms: if sampled == 0 { 0.0 } else { total_ms / f64::from(sampled) },
        files_sampled: sampled,
    })
}

// ── Whole-image defragmentation ─────────────────────────────────────────────

/// Outcome of a defragmentation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefragReport {
    pub files_processed: u32,
    pub files_relocated: u32,
    pub cancelled: bool,
    pub before: BenchmarkResults,
    /// Absent when the pass was cancelled.
    pub after: Option<BenchmarkResults>,
}

struct CollectedFile {
    ino: InodeNumber,
    record: InodeRecord,
    content: Vec<u8>,
    old_blocks: Vec<BlockNumber>,
}

/// Relocate every regular file into contiguous low-address runs.
///
/// The cancellation flag is honored between files while collecting — at
/// that point nothing has been released and the image is untouched. Once
/// the release phase has started every collected file is always rewritten
/// (its content exists only in memory); a cancel observed then suppresses
/// the after-benchmark and reports `cancelled`.
///
/// A `NoSpace` failure during reallocation is reported without rollback; it
/// can only occur on an over-full image.
pub fn defragment_file_system(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    sb: &mut Superblock,
    cancelled: &AtomicBool,
    progress: Option<&ProgressFn>,
) -> Result<DefragReport> {
    let mut report = DefragReport {
        before: run_benchmark(dev, geo, 50)?,
        ..DefragReport::default()
    };

    // Collect. Abort here is free: the image has not been modified.
    let mut collected = Vec::new();
    let candidates: Vec<(InodeNumber, InodeRecord)> = sfs_inode::live_inodes(dev, geo)?
        .into_iter()
        .filter(|(_, r)| r.file_type == FileType::Regular && r.file_size > 0)
        .collect();
    let total = candidates.len().max(1);

    for (idx, (ino, record)) in candidates.into_iter().enumerate() {
        if cancelled.load(Ordering::Relaxed) {
            report.files_processed = idx as u32;
            report.cancelled = true;
            info!(target: "sfs::defrag", event = "cancelled_during_collect", collected = idx);
            return Ok(report);
        }

        let mut old_blocks = sfs_inode::enumerate_blocks(dev, geo, &record)?;
        let mut content = Vec::with_capacity(record.file_size as usize);
        for block in &old_blocks {
            content.extend_from_slice(&dev.read_block(*block)?);
        }
        content.truncate(record.file_size as usize);
        if let Some(indirect) = record.indirect.get() {
            old_blocks.push(indirect);
        }

        report_progress(progress, idx, total, "collecting files");
        collected.push(CollectedFile {
            ino,
            record,
            content,
            old_blocks,
        });
    }

    // Release everything before allocating anything: this is what lets
    // first-fit converge on a packed prefix of the data region.
    for file in &mut collected {
        for block in &file.old_blocks {
            bitmap.free(dev, *block)?;
        }
        file.record.direct = [BlockPtr::None; sfs_types::DIRECT_BLOCKS];
        file.record.indirect = BlockPtr::None;
        file.record.block_count = 0;
        sfs_inode::write_inode(dev, geo, file.ino, &file.record)?;
    }

    // Reallocate in inode order; cancellation can no longer abandon files.
    let mut cancel_seen = false;
    let total_files = collected.len();
    for (idx, file) in collected.iter_mut().enumerate() {
        cancel_seen |= cancelled.load(Ordering::Relaxed);

        // Claim every data block before wiring any pointer, so the indirect
        // block (allocated during wiring) cannot split the file's run.
        let needed = blocks_for_bytes(file.content.len());
        let mut new_blocks = Vec::with_capacity(needed as usize);
        for _ in 0..needed {
            new_blocks.push(bitmap.allocate_compact()?);
        }
        for (i, block) in new_blocks.iter().enumerate() {
            let start = i * BLOCK_SIZE as usize;
            let end = (start + BLOCK_SIZE as usize).min(file.content.len());
            let mut payload = vec![0_u8; BLOCK_SIZE as usize];
            payload[..end - start].copy_from_slice(&file.content[start..end]);
            dev.write_block(*block, &payload)?;
            sfs_inode::add_block(dev, geo, bitmap, &mut file.record, *block)?;
        }
        sfs_inode::write_inode(dev, geo, file.ino, &file.record)?;

        report.files_processed += 1;
        report.files_relocated += 1;
        report_progress(progress, idx, total_files, "rewriting files");
    }

    bitmap.flush(dev, geo)?;
    sb.free_blocks = bitmap.free_blocks();
    sfs_alloc::write_superblock(dev, sb)?;

    report.cancelled = cancel_seen;
    if !cancel_seen {
        report.after = Some(run_benchmark(dev, geo, 50)?);
    }

    info!(
        target: "sfs::defrag",
        event = "defrag_finished",
        files = report.files_relocated,
        cancelled = report.cancelled
    );
    Ok(report)
}

/// Rewrite a single file through free-then-allocate.
///
/// The degenerate per-file form: contiguity is only guaranteed when the
/// rest of the image happens to have room at low addresses. Returns whether
/// the file was rewritten.
pub fn defragment_file(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    ino: InodeNumber,
) -> Result<bool> {
    let mut record = sfs_inode::read_inode(dev, geo, ino)?;
    if record.file_type != FileType::Regular || record.block_count == 0 {
        return Ok(false);
    }

    let mut old_blocks = sfs_inode::enumerate_blocks(dev, geo, &record)?;
    let mut content = Vec::with_capacity(record.file_size as usize);
    for block in &old_blocks {
        content.extend_from_slice(&dev.read_block(*block)?);
    }
    content.truncate(record.file_size as usize);
    if let Some(indirect) = record.indirect.get() {
        old_blocks.push(indirect);
    }

    for block in &old_blocks {
        bitmap.free(dev, *block)?;
    }
    record.direct = [BlockPtr::None; sfs_types::DIRECT_BLOCKS];
    record.indirect = BlockPtr::None;
    record.block_count = 0;

    let needed = blocks_for_bytes(content.len());
    let mut new_blocks = Vec::with_capacity(needed as usize);
    for _ in 0..needed {
        new_blocks.push(bitmap.allocate_compact()?);
    }
    for (block, chunk) in new_blocks.iter().zip(content.chunks(BLOCK_SIZE as usize)) {
        let mut payload = vec![0_u8; BLOCK_SIZE as usize];
        payload[..chunk.len()].copy_from_slice(chunk);
        dev.write_block(*block, &payload)?;
        sfs_inode::add_block(dev, geo, bitmap, &mut record, *block)?;
    }
    sfs_inode::write_inode(dev, geo, ino, &record)?;
    debug!(target: "sfs::defrag", event = "file_defragmented", inode = ino.0);
    Ok(true)
}

fn report_progress(progress: Option<&ProgressFn>, idx: usize, total: usize, message: &str) {
    if let Some(callback) = progress {
        let percent = ((idx + 1) * 100 / total.max(1)).min(100) as u8;
        callback(percent, message);
    }
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

    struct Fixture {
        dev: MemBlockDevice,
        geo: FsGeometry,
        bitmap: BlockBitmap,
        sb: Superblock,
    }

    fn setup() -> Fixture {
        let geo = FsGeometry::for_total_blocks(2048).unwrap();
        let dev = MemBlockDevice::new(2048);
        let bitmap = BlockBitmap::new_formatted(&geo);
        let sb = Superblock {
            total_blocks: geo.total_blocks,
            free_blocks: bitmap.free_blocks(),
            block_size: 4096,
            inode_count: geo.inode_count,
            free_inodes: geo.inode_count,
            bitmap_start: geo.bitmap_start,
            inode_table_start: geo.inode_table_start,
            data_blocks_start: geo.data_blocks_start,
            journal_start: geo.journal_start,
            journal_size: geo.journal_blocks,
            clean_shutdown: 1,
            crashed_write_inode: None,
        };
        Fixture {
            dev,
            geo,
            bitmap,
            sb,
        }
    }

    fn make_file(fx: &mut Fixture, data: &[u8]) -> InodeNumber {
        let (ino, mut record) =
            sfs_inode::allocate_inode(&fx.dev, &fx.geo, FileType::Regular, 0).unwrap();
        for chunk in data.chunks(4096) {
            let block = fx.bitmap.allocate().unwrap();
            let mut payload = vec![0_u8; 4096];
            payload[..chunk.len()].copy_from_slice(chunk);
            fx.dev.write_block(block, &payload).unwrap();
            sfs_inode::add_block(&fx.dev, &fx.geo, &mut fx.bitmap, &mut record, block).unwrap();
        }
        record.file_size = data.len() as u32;
        sfs_inode::write_inode(&fx.dev, &fx.geo, ino, &record).unwrap();
        ino
    }

    fn read_content(fx: &Fixture, ino: InodeNumber) -> Vec<u8> {
        let record = sfs_inode::read_inode(&fx.dev, &fx.geo, ino).unwrap();
        let mut data = Vec::new();
        for block in sfs_inode::enumerate_blocks(&fx.dev, &fx.geo, &record).unwrap() {
            data.extend_from_slice(&fx.dev.read_block(block).unwrap());
        }
        data.truncate(record.file_size as usize);
        data
    }

    fn delete_file(fx: &mut Fixture, ino: InodeNumber) {
        sfs_inode::free_inode(&fx.dev, &fx.geo, &mut fx.bitmap, ino).unwrap();
    }

    #[test]
    fn count_runs_on_block_lists() {
        assert_eq!(count_runs(&[]), 0);
        assert_eq!(count_runs(&[BlockNumber(5)]), 1);
        assert_eq!(
            count_runs(&[BlockNumber(5), BlockNumber(6), BlockNumber(7)]),
            1
        );
        assert_eq!(
            count_runs(&[BlockNumber(5), BlockNumber(7), BlockNumber(8)]),
            2
        );
        // Counting sorts first: append order does not matter.
        assert_eq!(
            count_runs(&[BlockNumber(8), BlockNumber(5), BlockNumber(7)]),
            2
        );
    }

    #[test]
    fn fresh_files_score_zero() {
        let mut fx = setup();
        make_file(&mut fx, &[1_u8; 8192]);
        make_file(&mut fx, &[2_u8; 4096]);

        let report = analyze_fragmentation(&fx.dev, &fx.geo, &fx.bitmap).unwrap();
        assert_eq!(report.total_files, 2);
        assert_eq!(report.fragmented_files, 0);
        assert_eq!(report.fragmentation_score, 0.0);
    }

    #[test]
    fn interleaved_rewrites_fragment_the_image() {
        let mut fx = setup();
        // Lay down files, punch holes, then write files that fall into the
        // scattered holes.
        let mut first = Vec::new();
        for i in 0..10_u8 {
            first.push(make_file(&mut fx, &[i; 8192]));
        }
        for ino in first.iter().step_by(2) {
            delete_file(&mut fx, *ino);
        }
        for i in 0..5_u8 {
            make_file(&mut fx, &[0xA0 + i; 12 * 1024]);
        }

        let report = analyze_fragmentation(&fx.dev, &fx.geo, &fx.bitmap).unwrap();
        assert!(report.fragmented_files > 0, "{report:?}");
        assert!(report.fragmentation_score > 0.0);
    }

    #[test]
    fn defrag_packs_files_into_single_runs() {
        let mut fx = setup();
        let mut survivors = Vec::new();
        let mut victims = Vec::new();
        for i in 0..10_u8 {
            let ino = make_file(&mut fx, &[i; 8192]);
            if i % 2 == 0 {
                victims.push(ino);
            } else {
                survivors.push((ino, vec![i; 8192]));
            }
        }
        for ino in victims {
            delete_file(&mut fx, ino);
        }
        for i in 0..5_u8 {
            let data = vec![0xB0 + i; 12 * 1024];
            let ino = make_file(&mut fx, &data);
            survivors.push((ino, data));
        }
        assert!(
            analyze_fragmentation(&fx.dev, &fx.geo, &fx.bitmap)
                .unwrap()
                .fragmentation_score
                > 0.0
        );

        let cancelled = AtomicBool::new(false);
        let report = defragment_file_system(
            &fx.dev, &fx.geo, &mut fx.bitmap, &mut fx.sb, &cancelled, None,
        )
        .unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.files_relocated, 10);
        assert!(report.after.is_some());

        let after = analyze_fragmentation(&fx.dev, &fx.geo, &fx.bitmap).unwrap();
        assert_eq!(after.fragmentation_score, 0.0, "{after:?}");

        // Contents survive relocation.
        for (ino, data) in &survivors {
            assert_eq!(&read_content(&fx, *ino), data);
        }

        // Files collectively occupy a packed prefix of the data region.
        let mut all_blocks = Vec::new();
        for (ino, _) in &survivors {
            let record = sfs_inode::read_inode(&fx.dev, &fx.geo, *ino).unwrap();
            all_blocks.extend(sfs_inode::enumerate_blocks(&fx.dev, &fx.geo, &record).unwrap());
        }
        let max = all_blocks.iter().map(|b| b.0).max().unwrap();
        assert_eq!(
            u32::try_from(all_blocks.len()).unwrap(),
            max - fx.geo.data_blocks_start + 1
        );
    }

    #[test]
    fn second_defrag_pass_changes_nothing() {
        let mut fx = setup();
        for i in 0..6_u8 {
            make_file(&mut fx, &[i; 8192]);
        }

        let cancelled = AtomicBool::new(false);
        defragment_file_system(&fx.dev, &fx.geo, &mut fx.bitmap, &mut fx.sb, &cancelled, None)
            .unwrap();

        let snapshot: Vec<(InodeNumber, Vec<BlockNumber>)> = sfs_inode::live_inodes(&fx.dev, &fx.geo)
            .unwrap()
            .into_iter()
            .map(|(ino, rec)| {
                (ino, sfs_inode::enumerate_blocks(&fx.dev, &fx.geo, &rec).unwrap())
            })
            .collect();

        defragment_file_system(&fx.dev, &fx.geo, &mut fx.bitmap, &mut fx.sb, &cancelled, None)
            .unwrap();

        let again: Vec<(InodeNumber, Vec<BlockNumber>)> = sfs_inode::live_inodes(&fx.dev, &fx.geo)
            .unwrap()
            .into_iter()
            .map(|(ino, rec)| {
                (ino, sfs_inode::enumerate_blocks(&fx.dev, &fx.geo, &rec).unwrap())
            })
            .collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn cancellation_before_release_leaves_image_untouched() {
        let mut fx = setup();
        let ino = make_file(&mut fx, &[3_u8; 8192]);
        let record_before = sfs_inode::read_inode(&fx.dev, &fx.geo, ino).unwrap();
        let free_before = fx.bitmap.free_blocks();

        let cancelled = AtomicBool::new(true);
        let report = defragment_file_system(
            &fx.dev, &fx.geo, &mut fx.bitmap, &mut fx.sb, &cancelled, None,
        )
        .unwrap();

        assert!(report.cancelled);
        assert!(report.after.is_none());
        assert_eq!(fx.bitmap.free_blocks(), free_before);
        assert_eq!(
            sfs_inode::read_inode(&fx.dev, &fx.geo, ino).unwrap(),
            record_before
        );
    }

    #[test]
    fn per_file_defrag_rewrites_content() {
        let mut fx = setup();
        // Fragment one file by hand: allocate its blocks with gaps.
        let (ino, mut record) =
            sfs_inode::allocate_inode(&fx.dev, &fx.geo, FileType::Regular, 0).unwrap();
        let mut data = Vec::new();
        for i in 0..3_u8 {
            let block = fx.bitmap.allocate().unwrap();
            let _gap = fx.bitmap.allocate().unwrap();
            let payload = vec![i; 4096];
            fx.dev.write_block(block, &payload).unwrap();
            sfs_inode::add_block(&fx.dev, &fx.geo, &mut fx.bitmap, &mut record, block).unwrap();
            data.extend_from_slice(&payload);
        }
        record.file_size = data.len() as u32;
        sfs_inode::write_inode(&fx.dev, &fx.geo, ino, &record).unwrap();

        let before = sfs_inode::read_inode(&fx.dev, &fx.geo, ino).unwrap();
        assert!(count_runs(&sfs_inode::enumerate_blocks(&fx.dev, &fx.geo, &before).unwrap()) > 1);

        assert!(defragment_file(&fx.dev, &fx.geo, &mut fx.bitmap, ino).unwrap());
        assert_eq!(read_content(&fx, ino), data);

        // Directory inodes and empty files are skipped.
        let (empty, _) =
            sfs_inode::allocate_inode(&fx.dev, &fx.geo, FileType::Regular, 0).unwrap();
        assert!(!defragment_file(&fx.dev, &fx.geo, &mut fx.bitmap, empty).unwrap());
    }

    #[test]
    fn benchmark_samples_regular_files() {
        let mut fx = setup();
        for i in 0..4_u8 {
            make_file(&mut fx, &[i; 8192]);
        }
        let results = run_benchmark(&fx.dev, &fx.geo, 3).unwrap();
        assert_eq!(results.files_sampled, 3);
        assert!(results.avg_read_ms >= 0.0);

        let empty = run_benchmark(&fx.dev, &fx.geo, 0).unwrap();
        assert_eq!(empty.files_sampled, 0);
        assert_eq!(empty.avg_read_ms, 0.0);
    }

    #[test]
    fn defrag_survives_a_full_image() {
        let mut fx = setup();
        let ino = make_file(&mut fx, &[1_u8; 8192]);
        // Exhaust the free pool. The pass still succeeds: releasing the
        // collected file's own blocks is enough room to rehome it.
        while fx.bitmap.allocate().is_ok() {}

        let cancelled = AtomicBool::new(false);
        let report = defragment_file_system(
            &fx.dev, &fx.geo, &mut fx.bitmap, &mut fx.sb, &cancelled, None,
        )
        .unwrap();
        assert_eq!(report.files_relocated, 1);
        assert_eq!(read_content(&fx, ino), vec![1_u8; 8192]);
        assert_eq!(fx.bitmap.free_blocks(), 0);
    }
}
