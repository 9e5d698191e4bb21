use camino::Utf8PathBuf;
use mlk_core::Hash;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The delta is malformed or does not fit the source it is applied to.
    #[error("Patch could not be applied: {0}")]
    PatchApplicationFailure(String),

    /// Bytes did not hash to the value they were expected to have.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },

    /// The patch cache handle was used after [`close`](crate::BinaryPatchCache::close).
    #[error("Patch cache at {0} is closed")]
    CacheClosed(Utf8PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

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

    pub(crate) fn malformed(reason: impl ToString) -> Self {
        Error::PatchApplicationFailure(reason.to_string())
    }
}
