//! Content-keyed store of binary deltas.
//!
//! An entry is identified by the ordered pair `(from, to)` of source and
//! destination hashes and stored as `{from}_{to}.patch` (a zstd-compressed
//! [`Delta`](crate::Delta)). Entries are immutable once written.
//!
//! [`create_patch`](BinaryPatchCache::create_patch) is idempotent and coalesces
//! concurrent requests for the same key: one caller computes while the others
//! wait for its result. If that caller fails or is cancelled, a waiter takes over.

use crate::delta::{self, Delta};
use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::fs::write_new_atomic;
use mlk_core::{ByteProgressCallback, CancellationToken, Hash};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const ENTRY_EXTENSION: &str = "patch";
const ZSTD_LEVEL: i32 = 9;
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// A stored delta from `from` to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheEntry {
    pub from: Hash,
    pub to: Hash,
    /// Size of the stored (compressed) delta in bytes.
    pub patch_size: u64,
}

#[derive(Debug)]
pub struct BinaryPatchCache {
    dir: Utf8PathBuf,
    closed: AtomicBool,
    in_flight: Mutex<HashSet<(Hash, Hash)>>,
    finished: Condvar,
    computations: AtomicU64,
}

/// Releases an in-flight key and wakes waiters, on success or failure.
struct InFlight<'a> {
    cache: &'a BinaryPatchCache,
    key: (Hash, Hash),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.cache.in_flight.lock().remove(&self.key);
        self.cache.finished.notify_all();
    }
}

impl BinaryPatchCache {
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.as_std_path())?;
        tracing::debug!("Opened patch cache at {}", dir);
        Ok(Self {
            dir,
            closed: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            finished: Condvar::new(),
            computations: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Closed patch cache at {}", self.dir);
        }
        Ok(())
    }

    /// Number of deltas this handle has actually computed.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::SeqCst)
    }

    /// Ensure a delta from `src` to `dest` is stored and return its entry.
    ///
    /// Both hashes are checked against the bytes before anything is computed.
    pub fn create_patch(
        &self,
        src_hash: Hash,
        src: &[u8],
        dest_hash: Hash,
        dest: &[u8],
        progress: Option<&ByteProgressCallback>,
        token: &CancellationToken,
    ) -> Result<CacheEntry> {
        self.ensure_open()?;
        verify(src_hash, src)?;
        verify(dest_hash, dest)?;

        let key = (src_hash, dest_hash);
        let _claim = {
            let mut in_flight = self.in_flight.lock();
            loop {
                if let Some(entry) = self.get_patch(src_hash, dest_hash)? {
                    return Ok(entry);
                }
                if in_flight.insert(key) {
                    break InFlight { cache: self, key };
                }
                token.check()?;
                self.finished.wait_for(&mut in_flight, WAIT_SLICE);
            }
        };

        tracing::debug!("Computing patch {} -> {}", src_hash, dest_hash);
        let delta = delta::diff(src, dest, progress, token)?;
        let compressed = zstd::encode_all(&delta.to_bytes()[..], ZSTD_LEVEL)?;
        token.check()?;

        let path = self.entry_path(src_hash, dest_hash);
        write_new_atomic(&path, &compressed)?;
        self.computations.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(
            "Stored patch {} -> {} ({} bytes for a {} byte target)",
            src_hash,
            dest_hash,
            compressed.len(),
            dest.len()
        );
        Ok(CacheEntry {
            from: src_hash,
            to: dest_hash,
            patch_size: compressed.len() as u64,
        })
    }

    /// [`create_patch`](Self::create_patch), then read the stored delta back and
    /// check that it rebuilds `dest` from `src`.
    ///
    /// An entry that fails the check is evicted and computed once more; the
    /// returned bytes have always been verified.
    pub fn create_verified_patch(
        &self,
        src_hash: Hash,
        src: &[u8],
        dest_hash: Hash,
        dest: &[u8],
        progress: Option<&ByteProgressCallback>,
        token: &CancellationToken,
    ) -> Result<(CacheEntry, Vec<u8>)> {
        let entry = self.create_patch(src_hash, src, dest_hash, dest, progress, token)?;
        match self.load_checked(src, &entry, dest_hash) {
            Ok((data, _)) => return Ok((entry, data)),
            Err(e) => tracing::warn!("Recomputing patch {} -> {}: {}", src_hash, dest_hash, e),
        }

        let entry = self.create_patch(src_hash, src, dest_hash, dest, progress, token)?;
        let (data, _) = self.load_checked(src, &entry, dest_hash)?;
        Ok((entry, data))
    }

    /// Look up a stored delta without computing anything.
    pub fn get_patch(&self, from: Hash, to: Hash) -> Result<Option<CacheEntry>> {
        self.ensure_open()?;
        match std::fs::metadata(self.entry_path(from, to).as_std_path()) {
            Ok(metadata) => Ok(Some(CacheEntry {
                from,
                to,
                patch_size: metadata.len(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stored delta bytes for `entry`, decompressed.
    pub fn get_data(&self, entry: &CacheEntry) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let compressed = std::fs::read(self.entry_path(entry.from, entry.to).as_std_path())?;
        zstd::decode_all(&compressed[..])
            .map_err(|e| Error::PatchApplicationFailure(format!("undecodable patch data: {}", e)))
    }

    /// Apply delta bytes to `src`. Deterministic.
    pub fn apply_patch(&self, src: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        delta::apply(src, delta)
    }

    /// Apply the stored delta and check the result hashes to `expected`.
    ///
    /// On any failure the entry is evicted so that a later
    /// [`create_patch`](Self::create_patch) recomputes it.
    pub fn apply_verified(&self, src: &[u8], entry: &CacheEntry, expected: Hash) -> Result<Vec<u8>> {
        self.load_checked(src, entry, expected).map(|(_, out)| out)
    }

    /// Stored delta bytes and the output they rebuild from `src`, evicting the
    /// entry if either is wrong.
    fn load_checked(&self, src: &[u8], entry: &CacheEntry, expected: Hash) -> Result<(Vec<u8>, Vec<u8>)> {
        let result = self.get_data(entry).and_then(|data| {
            let out = Delta::from_bytes(&data)?.apply(src)?;
            verify(expected, &out)?;
            Ok((data, out))
        });

        if let Err(e) = &result {
            tracing::warn!(
                "Evicting patch {} -> {} after failed application: {}",
                entry.from,
                entry.to,
                e
            );
            self.evict(entry.from, entry.to)?;
        }
        result
    }

    pub fn evict(&self, from: Hash, to: Hash) -> Result<()> {
        match std::fs::remove_file(self.entry_path(from, to).as_std_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn entry_path(&self, from: Hash, to: Hash) -> Utf8PathBuf {
        self.dir.join(format!("{}_{}.{}", from, to, ENTRY_EXTENSION))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::CacheClosed(self.dir.clone()))
        } else {
            Ok(())
        }
    }
}

fn verify(expected: Hash, bytes: &[u8]) -> Result<()> {
    let actual = Hash::of(bytes);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::HashMismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::sync::Arc;

    fn open() -> (tempfile::TempDir, BinaryPatchCache) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("patches")).unwrap();
        let cache = BinaryPatchCache::open(path).unwrap();
        (dir, cache)
    }

    fn versions() -> (Vec<u8>, Vec<u8>) {
        let v1: Vec<u8> = (0..20_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut v2 = v1.clone();
        v2[40_000..40_010].copy_from_slice(b"version 2!");
        (v1, v2)
    }

    #[test]
    fn test_create_is_idempotent() {
        let (_dir, cache) = open();
        let (v1, v2) = versions();
        let token = CancellationToken::new();

        let first = cache
            .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &token)
            .unwrap();
        let second = cache
            .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &token)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.computations(), 1);
        assert_eq!(cache.get_patch(Hash::of(&v1), Hash::of(&v2)).unwrap(), Some(first));
        assert!(first.patch_size < v2.len() as u64 / 10);
    }

    #[test]
    fn test_concurrent_requests_compute_once() {
        let (_dir, cache) = open();
        let (v1, v2) = versions();
        let token = CancellationToken::new();

        let entries: Vec<CacheEntry> = (0..8)
            .into_par_iter()
            .map(|_| {
                cache
                    .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &token)
                    .unwrap()
            })
            .collect();

        assert!(entries.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.computations(), 1);
    }

    #[test]
    fn test_apply_verified_reconstructs_destination() {
        let (_dir, cache) = open();
        let (v1, v2) = versions();
        let entry = cache
            .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &CancellationToken::new())
            .unwrap();

        assert_eq!(cache.apply_verified(&v1, &entry, Hash::of(&v2)).unwrap(), v2);
        let data = cache.get_data(&entry).unwrap();
        assert_eq!(cache.apply_patch(&v1, &data).unwrap(), v2);
    }

    #[test]
    fn test_corrupt_entry_is_evicted() {
        let (_dir, cache) = open();
        let (v1, v2) = versions();
        let entry = cache
            .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &CancellationToken::new())
            .unwrap();

        std::fs::write(cache.entry_path(entry.from, entry.to).as_std_path(), b"junk").unwrap();
        assert!(matches!(
            cache.apply_verified(&v1, &entry, Hash::of(&v2)),
            Err(Error::PatchApplicationFailure(_))
        ));
        assert_eq!(cache.get_patch(entry.from, entry.to).unwrap(), None);
    }

    #[test]
    fn test_wrong_expected_hash_evicts() {
        let (_dir, cache) = open();
        let (v1, v2) = versions();
        let entry = cache
            .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &CancellationToken::new())
            .unwrap();

        assert!(matches!(
            cache.apply_verified(&v1, &entry, Hash(1)),
            Err(Error::HashMismatch { .. })
        ));
        assert_eq!(cache.get_patch(entry.from, entry.to).unwrap(), None);
    }

    #[test]
    fn test_mislabelled_input_is_rejected() {
        let (_dir, cache) = open();
        let (v1, v2) = versions();
        let result = cache.create_patch(
            Hash::of(&v1),
            &v1,
            Hash(42),
            &v2,
            None,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::HashMismatch { .. })));
        assert_eq!(cache.computations(), 0);
    }

    #[test]
    fn test_cancelled_leaves_no_entry() {
        let (_dir, cache) = open();
        let (v1, v2) = versions();
        let token = CancellationToken::new();
        token.cancel();

        let result = cache.create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &token);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(cache.get_patch(Hash::of(&v1), Hash::of(&v2)).unwrap(), None);
        // The key is released for the next caller.
        assert!(cache
            .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &CancellationToken::new())
            .is_ok());
    }

    #[test]
    fn test_verified_create_recomputes_tampered_entry() {
        let (_dir, cache) = open();
        let (v1, v2) = versions();
        let token = CancellationToken::new();
        let entry = cache
            .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &token)
            .unwrap();

        let path = cache.entry_path(entry.from, entry.to);
        let mut delta = zstd::decode_all(&std::fs::read(&path).unwrap()[..]).unwrap();
        *delta.last_mut().unwrap() ^= 0x5a;
        std::fs::write(&path, zstd::encode_all(&delta[..], 3).unwrap()).unwrap();

        let (_, data) = cache
            .create_verified_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &token)
            .unwrap();
        assert_eq!(cache.apply_patch(&v1, &data).unwrap(), v2);
        assert_eq!(cache.computations(), 2);
        assert_eq!(cache.apply_verified(&v1, &entry, Hash::of(&v2)).unwrap(), v2);
    }

    #[test]
    fn test_verified_create_recomputes_undecodable_entry() {
        let (_dir, cache) = open();
        let (v1, v2) = versions();
        let token = CancellationToken::new();
        let entry = cache
            .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &token)
            .unwrap();
        std::fs::write(cache.entry_path(entry.from, entry.to), b"junk").unwrap();

        let (_, data) = cache
            .create_verified_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &token)
            .unwrap();
        assert_eq!(cache.apply_patch(&v1, &data).unwrap(), v2);
        assert_eq!(cache.computations(), 2);
    }

    #[test]
    fn test_cancelled_mid_diff_leaves_no_entry() {
        let (dir, cache) = open();
        let v1: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let v2: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(40503) >> 7) as u8).collect();
        let token = CancellationToken::new();
        let canceller = token.clone();
        let furthest = Arc::new(AtomicU64::new(0));
        let seen = furthest.clone();
        let progress: ByteProgressCallback = Arc::new(move |p: mlk_core::ByteProgress| {
            seen.fetch_max(p.done, Ordering::SeqCst);
            if p.done >= p.total / 3 {
                canceller.cancel();
            }
        });

        let result = cache.create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, Some(&progress), &token);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(furthest.load(Ordering::SeqCst) < v2.len() as u64);
        assert_eq!(cache.get_patch(Hash::of(&v1), Hash::of(&v2)).unwrap(), None);
        assert_eq!(cache.computations(), 0);
        let leftovers = std::fs::read_dir(dir.path().join("patches")).unwrap().count();
        assert_eq!(leftovers, 0);

        assert!(cache.in_flight.lock().is_empty());
        assert!(cache
            .create_patch(Hash::of(&v1), &v1, Hash::of(&v2), &v2, None, &CancellationToken::new())
            .is_ok());
    }

    #[test]
    fn test_closed_cache_rejects_use() {
        let (_dir, cache) = open();
        cache.close().unwrap();
        assert!(matches!(cache.get_patch(Hash(1), Hash(2)), Err(Error::CacheClosed(_))));
    }
}
