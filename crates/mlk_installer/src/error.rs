//! Error types for installation.
//!
//! Most failures are scoped to one directive and end up in the
//! [`InstallReport`](crate::InstallReport) as a [`FailureKind`] plus message; only
//! setup problems and cancellation abort an install.

use crate::download::DownloadError;
use camino::Utf8PathBuf;
use mlk_core::Hash;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot access {path}: {source}")]
    IoFault {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid installer settings: {0}")]
    InvalidSettings(String),

    /// Reconstructed bytes are not the bytes the recipe promised.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },

    /// Output has the wrong size where only the size can be checked.
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// A required archive is neither present nor downloadable.
    #[error("Archive {name} ({hash}) is missing: {reason}")]
    MissingArchive {
        name: String,
        hash: Hash,
        reason: String,
    },

    /// A directive depends on another output that was not produced.
    #[error("Depends on {0}, which was not installed")]
    MissingDependency(String),

    #[error("No image analyzer is configured to re-encode textures")]
    NoImageAnalyzer,

    #[error("No container codec for format '{0}'")]
    NoCodec(String),

    #[error("Download failed: {0}")]
    Download(DownloadError),

    #[error("{0}")]
    Vfs(mlk_vfs::Error),

    #[error("{0}")]
    Patch(mlk_patch::Error),

    #[error("{0}")]
    Recipe(#[from] mlk_recipe::Error),

    #[error("{0}")]
    Core(mlk_core::Error),

    #[error("Installation cancelled")]
    Cancelled,
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

impl From<DownloadError> for Error {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Cancelled => Error::Cancelled,
            other => Error::Download(other),
        }
    }
}

impl From<mlk_vfs::Error> for Error {
    fn from(e: mlk_vfs::Error) -> Self {
        if e.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Vfs(e)
        }
    }
}

impl From<mlk_patch::Error> for Error {
    fn from(e: mlk_patch::Error) -> Self {
        match e {
            mlk_patch::Error::Cancelled => Error::Cancelled,
            mlk_patch::Error::HashMismatch { expected, actual } => {
                Error::HashMismatch { expected, actual }
            }
            other => Error::Patch(other),
        }
    }
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Error::HashMismatch { .. } | Error::SizeMismatch { .. } => FailureKind::HashMismatch,
            Error::MissingArchive { .. } => FailureKind::MissingArchive,
            Error::Patch(mlk_patch::Error::PatchApplicationFailure(_)) => {
                FailureKind::PatchApplicationFailure
            }
            Error::Vfs(mlk_vfs::Error::CorruptArchive { .. }) => FailureKind::CorruptArchive,
            Error::Io(_) | Error::IoFault { .. } | Error::Vfs(mlk_vfs::Error::IoFault { .. }) => {
                FailureKind::IoFault
            }
            Error::MissingDependency(_) => FailureKind::MissingDependency,
            _ => FailureKind::Other,
        }
    }
}

/// Coarse classification of a failed directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    IoFault,
    CorruptArchive,
    HashMismatch,
    PatchApplicationFailure,
    MissingArchive,
    MissingDependency,
    Other,
}
