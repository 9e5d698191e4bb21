//! Error types for loading and writing recipes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The package has no entry with this name.
    #[error("Recipe package has no entry '{0}'")]
    MissingEntry(String),

    /// The recipe is structurally unusable for installation.
    #[error("Invalid recipe: {0}")]
    InvalidRecipe(String),

    #[error("Unsupported recipe format version {found} (expected at most {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("{0}")]
    Core(#[from] mlk_core::Error),
}
