#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sfs_core::{BlockRole, FileSystem, MountStatus};
use sfs_types::{BlockNumber, DEFAULT_IMAGE_BYTES};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "sfs", about = "SimpleFS — a user-space filesystem in a file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a new image.
    Mkfs {
        /// Path of the image file to create.
        image: PathBuf,
        /// Image size in MiB.
        #[arg(long, default_value_t = DEFAULT_IMAGE_BYTES / (1024 * 1024))]
        size_mib: u64,
    },
    /// Show image statistics.
    Inspect {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory.
    Ls {
        image: PathBuf,
        /// Directory path inside the image.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Copy a host file into the image (creating it if needed).
    Write {
        image: PathBuf,
        /// Destination path inside the image.
        dest: String,
        /// Host file to copy from.
        input: PathBuf,
    },
    /// Copy a file out of the image.
    Read {
        image: PathBuf,
        /// Source path inside the image.
        src: String,
        /// Host file to write to (stdout when omitted).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete a file.
    Rm { image: PathBuf, path: String },
    /// Create a directory.
    Mkdir { image: PathBuf, path: String },
    /// Delete an empty directory.
    Rmdir { image: PathBuf, path: String },
    /// Analyse fragmentation.
    Frag {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Defragment the whole image and report the latency change.
    Defrag {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Seed the image with a fragmenting create/delete workload.
    Fragment {
        image: PathBuf,
        /// Number of seed files.
        #[arg(long, default_value_t = 50)]
        files: u32,
    },
    /// Simulate a power cut in the middle of a write.
    Crash {
        image: PathBuf,
        /// Path of the file whose write is interrupted.
        path: String,
        /// Intended write size in KiB.
        #[arg(long, default_value_t = 16)]
        size_kib: u32,
        /// Fraction of the write that lands before the cut.
        #[arg(long, default_value_t = 0.5)]
        percent: f64,
    },
    /// Run crash recovery.
    Recover {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Audit bitmap/inode consistency.
    Fsck {
        image: PathBuf,
        /// Free orphaned blocks after the audit.
        #[arg(long)]
        repair: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the role of every block.
    Blockmap {
        image: PathBuf,
        /// Only print this many data-region rows.
        #[arg(long, default_value_t = 64)]
        limit: u32,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    total_blocks: u32,
    free_blocks: u32,
    used_blocks: u32,
    free_inodes: u32,
    fragmentation_score: f64,
    clean_mount: bool,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Mkfs { image, size_mib } => mkfs(&image, size_mib),
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Ls { image, path } => ls(&image, &path),
        Command::Write { image, dest, input } => write_cmd(&image, &dest, &input),
        Command::Read { image, src, output } => read_cmd(&image, &src, output.as_deref()),
        Command::Rm { image, path } => with_image(&image, |fs| Ok(fs.delete_file(&path)?)),
        Command::Mkdir { image, path } => with_image(&image, |fs| Ok(fs.create_dir(&path)?)),
        Command::Rmdir { image, path } => with_image(&image, |fs| Ok(fs.delete_dir(&path)?)),
        Command::Frag { image, json } => frag(&image, json),
        Command::Defrag { image, json } => defrag(&image, json),
        Command::Fragment { image, files } => {
            with_image(&image, |fs| Ok(fs.simulate_fragmentation(files)?))
        }
        Command::Crash {
            image,
            path,
            size_kib,
            percent,
        } => crash(&image, &path, size_kib, percent),
        Command::Recover { image, json } => recover(&image, json),
        Command::Fsck {
            image,
            repair,
            json,
        } => fsck(&image, repair, json),
        Command::Blockmap { image, limit } => blockmap(&image, limit),
    }
}

fn mount(image: &PathBuf) -> Result<FileSystem> {
    let (fs, status) = FileSystem::mount(image)
        .with_context(|| format!("failed to mount {}", image.display()))?;
    if status == MountStatus::NeedsRecovery {
        eprintln!("warning: image was not cleanly unmounted; run `sfs recover`");
    }
    Ok(fs)
}

fn with_image(image: &PathBuf, op: impl FnOnce(&mut FileSystem) -> Result<()>) -> Result<()> {
    let mut fs = mount(image)?;
    op(&mut fs)?;
    fs.unmount()?;
    Ok(())
}

fn mkfs(image: &PathBuf, size_mib: u64) -> Result<()> {
    if size_mib == 0 {
        bail!("image size must be at least 1 MiB");
    }
    let mut fs = FileSystem::create(image, size_mib * 1024 * 1024)
        .with_context(|| format!("failed to create {}", image.display()))?;
    println!(
        "created {} ({} blocks, {} inodes free)",
        image.display(),
        fs.total_blocks(),
        fs.free_inodes()
    );
    fs.unmount()?;
    Ok(())
}

fn inspect(image: &PathBuf, json: bool) -> Result<()> {
    let (mut fs, status) = FileSystem::mount(image)
        .with_context(|| format!("failed to mount {}", image.display()))?;
    let output = InspectOutput {
        total_blocks: fs.total_blocks(),
        free_blocks: fs.free_blocks(),
        used_blocks: fs.used_blocks(),
        free_inodes: fs.free_inodes(),
        fragmentation_score: fs.fragmentation_score()?,
        clean_mount: status == MountStatus::Clean,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("SimpleFS image {}", image.display());
        println!("  blocks:        {} total, {} used, {} free",
            output.total_blocks, output.used_blocks, output.free_blocks);
        println!("  free inodes:   {}", output.free_inodes);
        println!("  fragmentation: {:.1}%", output.fragmentation_score);
        if !output.clean_mount {
            println!("  state:         dirty (unclean shutdown)");
        }
    }
    fs.unmount()?;
    Ok(())
}

fn ls(image: &PathBuf, path: &str) -> Result<()> {
    let mut fs = mount(image)?;
    for entry in fs.list_dir(path)? {
        let info = if path == "/" {
            fs.get_file_info(&format!("/{}", entry.name))
        } else {
            fs.get_file_info(&format!("{}/{}", path.trim_end_matches('/'), entry.name))
        };
        match info {
            Ok(info) => println!(
                "{:>8}  {:?}  {}",
                info.file_size, entry.file_type, entry.name
            ),
            Err(_) => println!("{:>8}  {:?}  {}", "-", entry.file_type, entry.name),
        }
    }
    fs.unmount()?;
    Ok(())
}

fn write_cmd(image: &PathBuf, dest: &str, input: &PathBuf) -> Result<()> {
    let data = std::fs::read(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    with_image(image, |fs| {
        if !fs.file_exists(dest) {
            fs.create_file(dest)?;
        }
        fs.write_file(dest, &data)?;
        println!("wrote {} bytes to {dest}", data.len());
        Ok(())
    })
}

fn read_cmd(image: &PathBuf, src: &str, output: Option<&std::path::Path>) -> Result<()> {
    let mut fs = mount(image)?;
    let data = fs.read_file(src)?;
    match output {
        Some(path) => {
            std::fs::write(path, &data)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("read {} bytes to {}", data.len(), path.display());
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }
    }
    fs.unmount()?;
    Ok(())
}

fn frag(image: &PathBuf, json: bool) -> Result<()> {
    let mut fs = mount(image)?;
    let report = fs.analyze_fragmentation()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} files, {} fragmented, score {:.1}%",
            report.total_files, report.fragmented_files, report.fragmentation_score
        );
        println!(
            "average {:.2} fragments per file, largest free region {} blocks",
            report.average_fragments_per_file, report.largest_contiguous_free_region
        );
    }
    fs.unmount()?;
    Ok(())
}

fn defrag(image: &PathBuf, json: bool) -> Result<()> {
    let mut fs = mount(image)?;
    let cancelled = AtomicBool::new(false);
    let report = fs.defragment_file_system(&cancelled)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("relocated {} files", report.files_relocated);
        if let Some(after) = report.after {
            println!(
                "read latency: {:.3} ms -> {:.3} ms",
                report.before.avg_read_ms, after.avg_read_ms
            );
        }
    }
    fs.unmount()?;
    Ok(())
}

fn crash(image: &PathBuf, path: &str, size_kib: u32, percent: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&percent) {
        bail!("--percent must lie in [0, 1]");
    }
    let mut fs = mount(image)?;
    let data: Vec<u8> = (0..size_kib as usize * 1024)
        .map(|i| (i % 251) as u8)
        .collect();
    let ino = fs.simulate_power_cut_during_write(path, &data, percent)?;
    println!(
        "simulated power cut writing {path} (inode {ino}): {} of {} bytes landed, {} blocks flagged",
        (data.len() as f64 * percent) as usize,
        data.len(),
        fs.corrupted_blocks().len()
    );
    // Deliberately no unmount: the whole point is to leave the image dirty.
    std::mem::forget(fs);
    Ok(())
}

fn recover(image: &PathBuf, json: bool) -> Result<()> {
    let mut fs = mount(image)?;

    // Mounting rehydrated the corruption set from the superblock's
    // interrupted-write marker, so recovery proper runs first; the orphan
    // audit then sweeps up anything a torn delete left behind.
    let recovery = fs.run_recovery()?;
    let audit = fs.check_consistency()?;
    let orphans_freed = if audit.orphan_blocks.is_empty() {
        0
    } else {
        fs.repair_orphans()?
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "orphans_freed": orphans_freed,
                "recovery": recovery,
            }))?
        );
    } else if recovery.removed_inodes.is_empty()
        && recovery.freed_blocks == 0
        && orphans_freed == 0
    {
        println!("image is consistent; nothing to recover");
    } else {
        println!(
            "removed {} inodes, {} directory entries, freed {} blocks",
            recovery.removed_inodes.len(),
            recovery.removed_entries.len(),
            recovery.freed_blocks
        );
        println!("freed {orphans_freed} orphan blocks");
    }
    fs.unmount()?;
    Ok(())
}

fn fsck(image: &PathBuf, repair: bool, json: bool) -> Result<()> {
    let mut fs = mount(image)?;
    let report = fs.check_consistency()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_consistent() {
        println!("clean: bitmap and inode table agree");
    } else {
        for error in &report.errors {
            println!("inconsistency: {error}");
        }
    }

    if repair && !report.orphan_blocks.is_empty() {
        let freed = fs.repair_orphans()?;
        println!("freed {freed} orphan blocks");
    }
    fs.unmount()?;
    Ok(())
}

fn blockmap(image: &PathBuf, limit: u32) -> Result<()> {
    let mut fs = mount(image)?;
    let total = fs.total_blocks();

    let mut shown = 0_u32;
    for i in 0..total {
        let block = BlockNumber(i);
        let role = fs.block_role(block)?;
        // System regions are summarized; data rows honor the limit.
        if matches!(role, BlockRole::FreeData) {
            continue;
        }
        if matches!(role, BlockRole::UsedData | BlockRole::Corrupted) {
            if shown >= limit {
                continue;
            }
            shown += 1;
        }
        match fs.get_block_owner(block) {
            Some(owner) => {
                let name = fs.filename_from_inode(owner)?;
                println!("{i:>8}  {role:?}  inode {owner} {name}");
            }
            None => println!("{i:>8}  {role:?}"),
        }
    }
    fs.unmount()?;
    Ok(())
}
