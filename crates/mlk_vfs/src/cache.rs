//! Persistent cache of indexed archive trees.
//!
//! Each fully expanded archive is stored once, keyed by its content hash, as a
//! zstd-compressed MessagePack file. Entries are immutable: writes use atomic
//! create-if-absent, so two workers indexing the same archive never corrupt each
//! other and the loser simply discards its copy.
//!
//! A decoded entry whose hash does not match its key, or that fails to decode, is
//! deleted and treated as a miss.

use crate::error::{Error, Result};
use crate::file::VirtualFile;
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::fs::write_new_atomic;
use mlk_core::Hash;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

const ENTRY_EXTENSION: &str = "vfs";
const ZSTD_LEVEL: i32 = 3;

/// Handle to an on-disk index cache directory.
///
/// Open with [`open`](Self::open), share by reference or `Arc`, and call
/// [`close`](Self::close) when the owning compile or install finishes.
#[derive(Debug)]
pub struct VfsCache {
    dir: Utf8PathBuf,
    closed: AtomicBool,
}

impl VfsCache {
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.as_std_path())?;
        tracing::debug!("Opened VFS cache at {}", dir);
        Ok(Self {
            dir,
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Mark the handle closed. Later calls fail with [`Error::CacheClosed`].
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Closed VFS cache at {}", self.dir);
        }
        Ok(())
    }

    pub fn get(&self, hash: Hash) -> Result<Option<VirtualFile>> {
        self.ensure_open()?;
        let path = self.entry_path(hash);
        let bytes = match std::fs::read(path.as_std_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match decode(&bytes) {
            Ok(file) if file.hash == hash => Ok(Some(file)),
            Ok(file) => {
                tracing::warn!(
                    "VFS cache entry {} holds {}, discarding",
                    hash,
                    file.hash
                );
                self.purge(hash)?;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Discarding unreadable VFS cache entry {}: {}", hash, e);
                self.purge(hash)?;
                Ok(None)
            }
        }
    }

    /// Store `file` unless an entry for its hash already exists.
    ///
    /// Returns `true` if this call wrote the entry.
    pub fn put(&self, file: &VirtualFile) -> Result<bool> {
        self.ensure_open()?;
        if file.hash.is_zero() {
            return Ok(false);
        }
        let path = self.entry_path(file.hash);
        if path.as_std_path().exists() {
            return Ok(false);
        }
        let encoded = rmp_serde::to_vec_named(file)?;
        let compressed = zstd::encode_all(&encoded[..], ZSTD_LEVEL)?;
        Ok(write_new_atomic(&path, &compressed)?)
    }

    pub fn contains(&self, hash: Hash) -> bool {
        self.entry_path(hash).as_std_path().exists()
    }

    pub fn purge(&self, hash: Hash) -> Result<()> {
        match std::fs::remove_file(self.entry_path(hash).as_std_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn entry_path(&self, hash: Hash) -> Utf8PathBuf {
        self.dir.join(format!("{}.{}", hash, ENTRY_EXTENSION))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::CacheClosed(self.dir.clone()))
        } else {
            Ok(())
        }
    }
}

fn decode(bytes: &[u8]) -> Result<VirtualFile> {
    let raw = zstd::decode_all(bytes)?;
    Ok(rmp_serde::from_slice(&raw)?)
}
