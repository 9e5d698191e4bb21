//! Filesystem helpers for content-addressed stores and output files.

use crate::error::Result;
use camino::Utf8Path;
use std::io::{self, Write};
use std::time::UNIX_EPOCH;
use tempfile::NamedTempFile;

/// Write `bytes` to `dest` only if nothing exists there yet.
///
/// The data is staged in a temporary file in the destination directory and moved
/// into place without clobbering, so concurrent writers of the same key never
/// observe a partial file. Returns `false` if another writer got there first.
pub fn write_new_atomic(dest: &Utf8Path, bytes: &[u8]) -> Result<bool> {
    let mut staged = stage_in(dest)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;

    match staged.persist_noclobber(dest.as_std_path()) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) if dest.as_std_path().exists() => {
            // Some platforms report a lost race with a different error kind.
            drop(e);
            Ok(false)
        }
        Err(e) => Err(e.error.into()),
    }
}

/// Create a temporary file next to `dest`, creating parent directories as needed.
///
/// Dropping the returned handle without persisting it removes the file.
pub fn stage_in(dest: &Utf8Path) -> Result<NamedTempFile> {
    let parent = match dest.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };
    std::fs::create_dir_all(parent.as_std_path())?;
    Ok(NamedTempFile::new_in(parent.as_std_path())?)
}

/// Modification time of a file as nanoseconds since the Unix epoch.
///
/// Used together with the file size to detect files that changed on disk.
pub fn modified_stamp(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
