//! Memo of content hashes for files on disk.
//!
//! Hashing a download pool of many gigabytes dominates a cold compile. The cache
//! remembers `(size, modification time) -> hash` per path so unchanged files are
//! never re-read. It is loaded on [`open`](FileHashCache::open) and written back on
//! [`close`](FileHashCache::close).

use crate::error::{Error, Result};
use crate::source::io_fault;
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::fs::{modified_stamp, stage_in};
use mlk_core::{CancellationToken, Hash};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct HashCacheEntry {
    size: u64,
    modified: u64,
    hash: Hash,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HashCacheFile {
    version: u32,
    entries: HashMap<Utf8PathBuf, HashCacheEntry>,
}

#[derive(Debug)]
pub struct FileHashCache {
    /// `None` for a purely in-memory cache.
    path: Option<Utf8PathBuf>,
    entries: RwLock<HashMap<Utf8PathBuf, HashCacheEntry>>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl FileHashCache {
    /// Load the cache file at `path`, starting empty if it is missing or unreadable.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(path.as_std_path()) {
            Ok(bytes) => match rmp_serde::from_slice::<HashCacheFile>(&bytes) {
                Ok(file) if file.version == FORMAT_VERSION => file.entries,
                Ok(file) => {
                    tracing::info!("Ignoring hash cache with version {}", file.version);
                    HashMap::new()
                }
                Err(e) => {
                    tracing::warn!("Ignoring unreadable hash cache {}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(io_fault(&path, e)),
        };

        tracing::debug!("Loaded {} cached file hashes from {}", entries.len(), path);
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// A cache that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Hash `path`, reusing the remembered value if size and mtime are unchanged.
    pub fn hash_file(&self, path: &Utf8Path, token: &CancellationToken) -> Result<Hash> {
        self.ensure_open()?;
        let metadata = std::fs::metadata(path.as_std_path()).map_err(|e| io_fault(path, e))?;
        let size = metadata.len();
        let modified = modified_stamp(&metadata);

        if let Some(entry) = self.entries.read().get(path) {
            if entry.size == size && entry.modified == modified {
                return Ok(entry.hash);
            }
        }

        let hash = match mlk_core::hash_file(path, token) {
            Ok(hash) => hash,
            Err(mlk_core::Error::Io(e)) => return Err(io_fault(path, e)),
            Err(e) => return Err(e.into()),
        };
        self.insert(path, HashCacheEntry { size, modified, hash });
        Ok(hash)
    }

    /// Remembered hash for `path`, if the file on disk still matches it.
    pub fn get(&self, path: &Utf8Path) -> Option<Hash> {
        let metadata = std::fs::metadata(path.as_std_path()).ok()?;
        let entries = self.entries.read();
        let entry = entries.get(path)?;
        (entry.size == metadata.len() && entry.modified == modified_stamp(&metadata))
            .then_some(entry.hash)
    }

    /// Record the hash of a file this process just wrote and verified.
    pub fn write(&self, path: &Utf8Path, hash: Hash) -> Result<()> {
        self.ensure_open()?;
        let metadata = std::fs::metadata(path.as_std_path()).map_err(|e| io_fault(path, e))?;
        self.insert(
            path,
            HashCacheEntry {
                size: metadata.len(),
                modified: modified_stamp(&metadata),
                hash,
            },
        );
        Ok(())
    }

    pub fn purge(&self, path: &Utf8Path) {
        if self.entries.write().remove(path).is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Write pending changes to disk.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let file = HashCacheFile {
            version: FORMAT_VERSION,
            entries: self.entries.read().clone(),
        };
        let encoded = rmp_serde::to_vec_named(&file)?;
        let mut staged = stage_in(path)?;
        staged.write_all(&encoded)?;
        staged
            .persist(path.as_std_path())
            .map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved {} file hashes to {}", file.entries.len(), path);
        Ok(())
    }

    /// Save and mark the handle closed.
    pub fn close(&self) -> Result<()> {
        self.save()?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn insert(&self, path: &Utf8Path, entry: HashCacheEntry) {
        self.entries.write().insert(path.to_path_buf(), entry);
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            let path = self.path.clone().unwrap_or_default();
            Err(Error::CacheClosed(path))
        } else {
            Ok(())
        }
    }
}
