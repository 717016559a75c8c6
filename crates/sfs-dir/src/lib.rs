#![forbid(unsafe_code)]
//! Directory operations.
//!
//! A directory's payload is its data blocks interpreted as packed 64-byte
//! entries. This crate reads and rewrites that payload, resolves
//! `/`-separated absolute paths to inode numbers, and bootstraps the root
//! directory at format time.
//!
//! Rewrites always serialize the live entry list contiguously from byte 0
//! of the first data block and zero everything behind it, including whole
//! blocks that are no longer needed — deleted entries must not resurface
//! on the next read.

use sfs_alloc::{BlockBitmap, FsGeometry};
use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{parse_dir_block, DirEntry, FileType, InodeRecord};
use sfs_types::{BlockNumber, InodeNumber, BLOCK_SIZE, DIR_ENTRIES_PER_BLOCK, DIR_ENTRY_SIZE,
    MAX_NAME_LEN};
use tracing::{debug, trace};

// ── Name and path validation ────────────────────────────────────────────────

/// Validate a single path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SfsError::InvalidArgument("empty filename".to_owned()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SfsError::InvalidArgument(format!(
            "filename '{name}' exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if name.contains('/') {
        return Err(SfsError::InvalidArgument(format!(
            "filename '{name}' contains '/'"
        )));
    }
    Ok(())
}

/// Split an absolute path into its parent directory path and final
/// component, e.g. `/sub/file` → (`/sub`, `file`).
pub fn split_parent(path: &str) -> Result<(&str, &str)> {
    if !path.starts_with('/') {
        return Err(SfsError::InvalidArgument(format!(
            "path '{path}' is not absolute"
        )));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(SfsError::InvalidArgument(
            "cannot split the root path".to_owned(),
        ));
    }
    let slash = trimmed.rfind('/').unwrap_or(0);
    let parent = if slash == 0 { "/" } else { &trimmed[..slash] };
    let name = &trimmed[slash + 1..];
    validate_name(name)?;
    Ok((parent, name))
}

// ── Entry list I/O ──────────────────────────────────────────────────────────

/// Read every live entry of a directory inode, in storage order.
pub fn read_entries(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    dir: &InodeRecord,
) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for block in sfs_inode::enumerate_blocks(dev, geo, dir)? {
        let data = dev.read_block(block)?;
        entries.extend(
            parse_dir_block(&data)
                .map_err(|e| SfsError::Corrupted(format!("directory block {block}: {e}")))?,
        );
    }
    Ok(entries)
}

/// Rewrite a directory's payload to exactly `entries`.
///
/// Grows the directory by one data block at a time when the list no longer
/// fits; surplus blocks stay wired to the inode but are zeroed. Updates
/// `file_size` and `modified` and persists the inode record. Returns any
/// blocks allocated by the grow path (the indirect block included) so the
/// caller can record ownership.
pub fn write_entries(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    dir: &mut InodeRecord,
    entries: &[DirEntry],
    now: i64,
) -> Result<Vec<BlockNumber>> {
    let blocks_needed = entries.len().div_ceil(DIR_ENTRIES_PER_BLOCK).max(1);
    let mut blocks = sfs_inode::enumerate_blocks(dev, geo, dir)?;
    let mut allocated = Vec::new();

    while blocks.len() < blocks_needed {
        let block = bitmap.allocate()?;
        allocated.push(block);
        if let Some(indirect) = sfs_inode::add_block(dev, geo, bitmap, dir, block)? {
            allocated.push(indirect);
        }
        blocks.push(block);
    }

    let mut chunks = entries.chunks(DIR_ENTRIES_PER_BLOCK);
    for (idx, block) in blocks.iter().enumerate() {
        let mut payload = vec![0_u8; BLOCK_SIZE as usize];
        if idx < blocks_needed {
            if let Some(chunk) = chunks.next() {
                for (slot, entry) in chunk.iter().enumerate() {
                    let at = slot * DIR_ENTRY_SIZE;
                    entry.serialize_into(&mut payload[at..at + DIR_ENTRY_SIZE]);
                }
            }
        }
        // Blocks past blocks_needed are written as all zeros.
        dev.write_block(*block, &payload)?;
    }

    // File size counts live entries only.
    dir.file_size = (entries.len() * DIR_ENTRY_SIZE) as u32;
    dir.modified = now;
    sfs_inode::write_inode(dev, geo, dir.number, dir)?;
    Ok(allocated)
}

// ── Entry management ────────────────────────────────────────────────────────

/// Read a directory inode, rejecting non-directories.
pub fn read_dir_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    dir_ino: InodeNumber,
) -> Result<InodeRecord> {
    let record = sfs_inode::read_inode(dev, geo, dir_ino)?;
    if record.file_type != FileType::Directory {
        return Err(SfsError::NotDirectory(format!("inode {dir_ino}")));
    }
    Ok(record)
}

/// Add an entry to a directory. Rejects duplicates.
pub fn add_entry(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    dir_ino: InodeNumber,
    name: &str,
    child: InodeNumber,
    file_type: FileType,
    now: i64,
) -> Result<Vec<BlockNumber>> {
    validate_name(name)?;
    let mut dir = read_dir_inode(dev, geo, dir_ino)?;
    let mut entries = read_entries(dev, geo, &dir)?;

    if entries.iter().any(|e| e.name == name) {
        return Err(SfsError::AlreadyExists(name.to_owned()));
    }

    entries.push(DirEntry {
        inode: child,
        file_type,
        name: name.to_owned(),
    });
    let allocated = write_entries(dev, geo, bitmap, &mut dir, &entries, now)?;
    trace!(target: "sfs::dir", event = "add_entry", dir = dir_ino.0, child = child.0, name);
    Ok(allocated)
}

/// Remove an entry by name, compacting the stored list.
pub fn remove_entry(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    dir_ino: InodeNumber,
    name: &str,
    now: i64,
) -> Result<()> {
    let mut dir = read_dir_inode(dev, geo, dir_ino)?;
    let mut entries = read_entries(dev, geo, &dir)?;

    let before = entries.len();
    entries.retain(|e| e.name != name);
    if entries.len() == before {
        return Err(SfsError::NotFound(name.to_owned()));
    }

    write_entries(dev, geo, bitmap, &mut dir, &entries, now)?;
    trace!(target: "sfs::dir", event = "remove_entry", dir = dir_ino.0, name);
    Ok(())
}

/// Look a name up in a directory. `Ok(None)` when absent.
pub fn lookup_entry(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    dir_ino: InodeNumber,
    name: &str,
) -> Result<Option<InodeNumber>> {
    let dir = read_dir_inode(dev, geo, dir_ino)?;
    let entries = read_entries(dev, geo, &dir)?;
    Ok(entries.into_iter().find(|e| e.name == name).map(|e| e.inode))
}

/// List a directory's live entries.
pub fn list_directory(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    dir_ino: InodeNumber,
) -> Result<Vec<DirEntry>> {
    let dir = read_dir_inode(dev, geo, dir_ino)?;
    read_entries(dev, geo, &dir)
}

// ── Path resolution ─────────────────────────────────────────────────────────

/// Walk an absolute `/`-separated path to an inode number.
///
/// Empty components are skipped, so `//a///b` resolves like `/a/b`. The
/// stored `.` and `..` entries are looked up like any other name; path
/// strings get no special dot handling.
pub fn resolve_path(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    path: &str,
) -> Result<InodeNumber> {
    if !path.starts_with('/') {
        return Err(SfsError::InvalidArgument(format!(
            "path '{path}' is not absolute"
        )));
    }

    let mut current = InodeNumber::ROOT;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current = lookup_entry(dev, geo, current, component)?
            .ok_or_else(|| SfsError::NotFound(path.to_owned()))?;
    }
    Ok(current)
}

// ── Directory creation ──────────────────────────────────────────────────────

/// A freshly created directory and the blocks each side of the link
/// gained, so callers can attribute ownership.
#[derive(Debug, Clone)]
pub struct CreatedDirectory {
    pub inode: InodeNumber,
    /// Blocks allocated for the new directory's own payload.
    pub own_blocks: Vec<BlockNumber>,
    /// Blocks the parent directory grew by to hold the new entry.
    pub parent_blocks: Vec<BlockNumber>,
}

/// Create a directory inode seeded with `.` and `..`, then link it into
/// its parent. The caller supplies the parent inode number; inodes carry
/// no back-pointers.
pub fn create_directory(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    name: &str,
    parent: InodeNumber,
    now: i64,
) -> Result<CreatedDirectory> {
    validate_name(name)?;
    if lookup_entry(dev, geo, parent, name)?.is_some() {
        return Err(SfsError::AlreadyExists(name.to_owned()));
    }

    let (ino, mut record) = sfs_inode::allocate_inode(dev, geo, FileType::Directory, now)?;
    let seed = [
        DirEntry {
            inode: ino,
            file_type: FileType::Directory,
            name: ".".to_owned(),
        },
        DirEntry {
            inode: parent,
            file_type: FileType::Directory,
            name: "..".to_owned(),
        },
    ];
    let own_blocks = write_entries(dev, geo, bitmap, &mut record, &seed, now)?;
    let parent_blocks = add_entry(dev, geo, bitmap, parent, name, ino, FileType::Directory, now)?;
    debug!(target: "sfs::dir", event = "create_directory", inode = ino.0, parent = parent.0, name);
    Ok(CreatedDirectory {
        inode: ino,
        own_blocks,
        parent_blocks,
    })
}

/// Bootstrap inode 0 as the root directory after formatting.
///
/// Both `.` and `..` point at the root itself. Idempotent: an already
/// valid root is left untouched.
pub fn init_root(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    bitmap: &mut BlockBitmap,
    now: i64,
) -> Result<Vec<BlockNumber>> {
    if let Ok(existing) = sfs_inode::read_inode(dev, geo, InodeNumber::ROOT) {
        if existing.is_valid() {
            return Ok(Vec::new());
        }
    }

    let mut root = InodeRecord::new(InodeNumber::ROOT, FileType::Directory, now);
    sfs_inode::write_inode(dev, geo, InodeNumber::ROOT, &root)?;
    let seed = [
        DirEntry {
            inode: InodeNumber::ROOT,
            file_type: FileType::Directory,
            name: ".".to_owned(),
        },
        DirEntry {
            inode: InodeNumber::ROOT,
            file_type: FileType::Directory,
            name: "..".to_owned(),
        },
    ];
    let allocated = write_entries(dev, geo, bitmap, &mut root, &seed, now)?;
    debug!(target: "sfs::dir", event = "root_initialized");
    Ok(allocated)
}
