//! Error types for compilation.
//!
//! Per-file outcomes never surface here: a file that cannot be traced becomes a
//! `NoMatch` directive and is listed in the [`CompileReport`](crate::CompileReport).
//! These errors abort the whole compile.

use camino::Utf8PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot read {path}: {source}")]
    IoFault {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid compiler settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Vfs(mlk_vfs::Error),

    #[error("{0}")]
    Patch(mlk_patch::Error),

    #[error("{0}")]
    Recipe(#[from] mlk_recipe::Error),

    #[error("{0}")]
    Core(mlk_core::Error),

    #[error("Compilation cancelled")]
    Cancelled,
}

impl From<mlk_core::Error> for Error {
    fn from(e: mlk_core::Error) -> Self {
        match e {
            mlk_core::Error::Cancelled => Error::Cancelled,
            other => Error::Core(other),
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
        if e.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Patch(e)
        }
    }
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
