#![forbid(unsafe_code)]
//! Error types for SimpleFS.
//!
//! Defines `SfsError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all SimpleFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    #[error("filesystem is not mounted")]
    NotMounted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no space left on image")]
    NoSpace,

    #[error("no free inodes")]
    NoInodes,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not a regular file: {0}")]
    NotRegularFile(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("file needs {blocks} blocks, inode addresses at most {max}")]
    TooLarge { blocks: u32, max: u32 },

    #[error("corrupt image: {0}")]
    Corrupted(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
