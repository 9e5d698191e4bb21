//! Content hashing.
//!
//! The content hash is xxHash64 (seed 0) over the exact bytes of a file. It is never
//! derived from a path or from metadata, so two files with the same hash are treated
//! as byte-identical everywhere in the pipeline.

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::progress::{ByteProgress, ByteProgressCallback};
use camino::Utf8Path;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use xxhash_rust::xxh64::{xxh64, Xxh64};

/// Bytes read between two cancellation checks while hashing.
pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// 64-bit content hash of a file's bytes.
///
/// Displayed and serialized as a 16-digit lowercase hex string. The zero value is
/// reserved to mean "not computed".
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Hash(pub u64);

impl Hash {
    pub const ZERO: Hash = Hash(0);

    /// Hash an in-memory buffer.
    pub fn of(bytes: &[u8]) -> Self {
        Hash(xxh64(bytes, 0))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidHash(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Hash)
            .map_err(|_| Error::InvalidHash(s.to_string()))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({:016x})", self.0)
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Hash::from_hex(s)
    }
}

impl From<Hash> for String {
    fn from(hash: Hash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for Hash {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Hash::from_hex(&s)
    }
}

/// Incremental content hasher producing the same value as [`Hash::of`].
#[derive(Clone)]
pub struct ContentHasher(Xxh64);

impl ContentHasher {
    pub fn new() -> Self {
        ContentHasher(Xxh64::new(0))
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(&self) -> Hash {
        Hash(self.0.digest())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream `reader` into `writer` while hashing, checking `token` once per chunk.
///
/// Returns the number of bytes copied and their content hash.
pub fn copy_hashed<R: Read, W: Write>(
    reader: R,
    writer: W,
    token: &CancellationToken,
    progress: Option<&ByteProgressCallback>,
    total: u64,
) -> Result<(u64, Hash)> {
    pump(reader, writer, token, progress, total)
}

/// Hash everything `reader` yields.
pub fn hash_reader<R: Read>(
    reader: R,
    token: &CancellationToken,
    progress: Option<&ByteProgressCallback>,
) -> Result<Hash> {
    pump(reader, io::sink(), token, progress, 0).map(|(_, hash)| hash)
}

/// Hash a file on disk.
pub fn hash_file(path: &Utf8Path, token: &CancellationToken) -> Result<Hash> {
    let file = std::fs::File::open(path.as_std_path())?;
    hash_reader(io::BufReader::new(file), token, None)
}

fn pump<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    token: &CancellationToken,
    progress: Option<&ByteProgressCallback>,
    total: u64,
) -> Result<(u64, Hash)> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    let mut done = 0u64;

    loop {
        token.check()?;

        // Fill a whole chunk so cancellation is checked at fixed boundaries.
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            break;
        }

        hasher.update(&buf[..filled]);
        writer.write_all(&buf[..filled])?;
        done += filled as u64;

        if let Some(progress) = progress {
            progress(ByteProgress { done, total });
        }
        if filled < buf.len() {
            break;
        }
    }

    writer.flush()?;
    Ok((done, hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = Hash(0x0123456789abcdef);
        assert_eq!(hash.to_string(), "0123456789abcdef");
        assert_eq!("0123456789abcdef".parse::<Hash>().unwrap(), hash);
    }

    #[test]
    fn test_hash_rejects_bad_hex() {
        assert!(Hash::from_hex("123").is_err());
        assert!(Hash::from_hex("zz23456789abcdef").is_err());
    }

    #[test]
    fn test_hash_serializes_as_string() {
        let json = serde_json::to_string(&Hash(255)).unwrap();
        assert_eq!(json, "\"00000000000000ff\"");
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Hash(255));
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..(HASH_CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let token = CancellationToken::new();
        let streamed = hash_reader(&data[..], &token, None).unwrap();
        assert_eq!(streamed, Hash::of(&data));
    }

    #[test]
    fn test_incremental_hasher_matches_one_shot() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), Hash::of(b"hello world"));
    }

    #[test]
    fn test_copy_hashed_reports_progress() {
        let data = vec![7u8; HASH_CHUNK_SIZE + 10];
        let token = CancellationToken::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        let callback: ByteProgressCallback = Arc::new(move |p: ByteProgress| {
            seen_clone.store(p.done, Ordering::SeqCst);
        });

        let mut out = Vec::new();
        let (len, hash) =
            copy_hashed(&data[..], &mut out, &token, Some(&callback), data.len() as u64).unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(hash, Hash::of(&data));
        assert_eq!(out, data);
        assert_eq!(seen.load(Ordering::SeqCst), data.len() as u64);
    }

    #[test]
    fn test_cancelled_hash_stops() {
        let token = CancellationToken::new();
        token.cancel();
        let result = hash_reader(&b"abc"[..], &token, None);
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
