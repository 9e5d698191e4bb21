//! Rebuilds a mod setup from a recipe package.
//!
//! The [`Installer`] finds or downloads every archive the recipe names, mounts
//! them in the VFS and replays each directive, verifying every written file
//! against the hash recorded at compile time.
//!
//! # Example
//!
//! ```no_run
//! use mlk_core::CancellationToken;
//! use mlk_installer::{Installer, InstallerSettings, LocalMirrorDownloader};
//! use mlk_patch::BinaryPatchCache;
//! use mlk_vfs::{Context, FileHashCache, VfsCache, VfsSettings};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let vfs = Context::new(
//!     Arc::new(VfsCache::open("cache/vfs")?),
//!     Arc::new(FileHashCache::open("cache/file_hashes.bin")?),
//!     VfsSettings::default(),
//! )?;
//! let patches = BinaryPatchCache::open("cache/patches")?;
//!
//! let settings = InstallerSettings::new("MyList.mlk", "C:/Games/MyList", "C:/Games/MyList/downloads");
//! let report = Installer::new(settings, Arc::new(vfs), Arc::new(patches))
//!     .with_downloader(Arc::new(LocalMirrorDownloader::new(["D:/Mirror"])))
//!     .install(&CancellationToken::new())?;
//! for failure in &report.failures {
//!     eprintln!("{}: {}", failure.to, failure.reason);
//! }
//! # Ok(())
//! # }
//! ```

pub mod download;
pub mod error;
pub mod installer;
mod replay;
pub mod settings;

#[cfg(test)]
mod scenarios;

pub use download::{DownloadError, Downloader, LocalMirrorDownloader, LOCAL_MIRROR_STATE};
pub use error::{Error, FailureKind, Result};
pub use installer::{DirectiveFailure, InstallProgress, InstallReport, InstallStage, Installer};
pub use replay::DirectiveState;
pub use settings::InstallerSettings;
