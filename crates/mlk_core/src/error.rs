//! Error types for the shared primitives.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem I/O failed while hashing or writing.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation observed a cancelled [`CancellationToken`](crate::CancellationToken).
    #[error("Operation cancelled")]
    Cancelled,

    /// A string could not be parsed as a 16-digit hex content hash.
    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    /// A path is absolute, escapes its root, or is otherwise not a valid relative path.
    #[error("Invalid relative path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

impl Error {
    /// Whether this error is the result of cancellation rather than a real fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
