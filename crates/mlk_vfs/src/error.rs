//! Error types for VFS operations.
//!
//! All fallible functions in this crate return [`Result<T>`]. Per-source failures
//! during pool indexing are reported as [`Error::IoFault`] and
//! [`Error::CorruptArchive`] and collected rather than aborting the whole pool.

use camino::Utf8PathBuf;
use mlk_core::{Hash, HashPath};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem I/O failed outside of a specific source.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A source could not be opened or read.
    #[error("Cannot read {path}: {source}")]
    IoFault {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A container was recognized but its internal structure is unreadable.
    #[error("Corrupt archive '{name}': {reason}")]
    CorruptArchive { name: String, reason: String },

    /// No root archive with this hash is known to the index.
    #[error("Unknown root archive {0}")]
    UnknownRoot(Hash),

    /// A hash-path segment does not exist in its container.
    #[error("'{entry}' not found while resolving {hash_path}")]
    EntryNotFound { hash_path: HashPath, entry: String },

    /// A hash-path descends into something that is not a readable container.
    #[error("'{entry}' is not a container while resolving {hash_path}")]
    NotAContainer { hash_path: HashPath, entry: String },

    /// No registered codec can handle the named container format.
    #[error("No container codec for format '{0}'")]
    UnsupportedFormat(String),

    /// The cache handle was used after [`close`](crate::VfsCache::close).
    #[error("Cache at {0} is closed")]
    CacheClosed(Utf8PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cache encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Cache decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{0}")]
    Core(mlk_core::Error),
}

impl From<mlk_core::Error> for Error {
    fn from(e: mlk_core::Error) -> Self {
        match e {
            mlk_core::Error::Cancelled => Error::Cancelled,
            mlk_core::Error::Io(io) => Error::Io(io),
            other => Error::Core(other),
        }
    }
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub(crate) fn corrupt(name: impl Into<String>, reason: impl ToString) -> Self {
        Error::CorruptArchive {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
