//! rsync-style binary deltas.
//!
//! The source is cut into fixed-size blocks, each summarized by a rolling weak
//! checksum and an xxh3 strong hash. A window slides over the target one byte at a
//! time; wherever the window matches a source block it becomes a `Copy`, and the
//! bytes in between become `Literal`s.
//!
//! # Format
//!
//! All integers little endian.
//!
//! ```text
//! magic        [u8; 4]  "MLKD"
//! version      u32
//! source_len   u64
//! target_len   u64
//! target_hash  u64      xxh64 of the reconstructed target
//! op_count     u32
//! ops:
//!   0u8 offset: u64 len: u64     copy from source
//!   1u8 len: u64 bytes[len]      literal
//! ```

use crate::error::{Error, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use mlk_core::{ByteProgress, ByteProgressCallback, CancellationToken, Hash};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use xxhash_rust::xxh3::xxh3_64;

pub const MAGIC: [u8; 4] = *b"MLKD";
pub const FORMAT_VERSION: u32 = 1;

pub const MIN_BLOCK_SIZE: usize = 700;
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

const OP_COPY: u8 = 0;
const OP_LITERAL: u8 = 1;

/// Block size for a source of `len` bytes: its square root, clamped.
pub fn block_size_for(len: usize) -> usize {
    ((len as f64).sqrt() as usize).clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    Copy { offset: u64, len: u64 },
    Literal(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub source_len: u64,
    pub target_len: u64,
    pub target_hash: Hash,
    pub ops: Vec<DeltaOp>,
}

/// Weak checksum from rsync: two 16-bit sums that can slide by one byte in O(1).
#[derive(Debug, Clone, Copy)]
struct Rolling {
    a: u32,
    b: u32,
    len: u32,
}

impl Rolling {
    fn new(block: &[u8]) -> Self {
        let len = block.len() as u32;
        let mut a = 0u32;
        let mut b = 0u32;
        for (i, &x) in block.iter().enumerate() {
            a = a.wrapping_add(x as u32);
            b = b.wrapping_add((len - i as u32).wrapping_mul(x as u32));
        }
        Self { a, b, len }
    }

    fn digest(&self) -> u32 {
        (self.a & 0xffff) | (self.b << 16)
    }

    fn roll(&mut self, out: u8, incoming: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(incoming as u32);
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(out as u32))
            .wrapping_add(self.a);
    }
}

/// Block summaries of a source. Transient: rebuilt for every diff.
struct Signature {
    block_size: usize,
    blocks: HashMap<u32, Vec<(usize, u64)>>,
}

impl Signature {
    fn build(source: &[u8], block_size: usize, token: &CancellationToken) -> Result<Self> {
        let mut blocks: HashMap<u32, Vec<(usize, u64)>> = HashMap::new();
        for (index, block) in source.chunks_exact(block_size).enumerate() {
            token.check()?;
            blocks
                .entry(Rolling::new(block).digest())
                .or_default()
                .push((index, xxh3_64(block)));
        }
        Ok(Self { block_size, blocks })
    }

    /// Source offset of a block equal to `window`, lowest first.
    fn find(&self, weak: u32, window: &[u8]) -> Option<u64> {
        let candidates = self.blocks.get(&weak)?;
        let strong = xxh3_64(window);
        candidates
            .iter()
            .find(|(_, s)| *s == strong)
            .map(|(index, _)| (*index * self.block_size) as u64)
    }
}

/// Compute the delta that turns `source` into `target`.
///
/// Progress is reported in target bytes; cancellation is checked once per block.
pub fn diff(
    source: &[u8],
    target: &[u8],
    progress: Option<&ByteProgressCallback>,
    token: &CancellationToken,
) -> Result<Delta> {
    let block_size = block_size_for(source.len());
    let total = target.len() as u64;
    let report = |done: usize| {
        if let Some(progress) = progress {
            progress(ByteProgress {
                done: done as u64,
                total,
            });
        }
    };

    let mut ops = Vec::new();
    if source.len() >= block_size && target.len() >= block_size {
        let signature = Signature::build(source, block_size, token)?;
        let mut pos = 0;
        let mut literal_start = 0;
        let mut next_check = 0;
        let mut rolling = Rolling::new(&target[..block_size]);

        loop {
            if pos >= next_check {
                token.check()?;
                report(pos);
                next_check = pos + block_size;
            }

            let window = &target[pos..pos + block_size];
            if let Some(offset) = signature.find(rolling.digest(), window) {
                push_literal(&mut ops, &target[literal_start..pos]);
                push_copy(&mut ops, offset, block_size as u64);
                pos += block_size;
                literal_start = pos;
                if pos + block_size > target.len() {
                    break;
                }
                rolling = Rolling::new(&target[pos..pos + block_size]);
            } else {
                if pos + block_size >= target.len() {
                    break;
                }
                rolling.roll(target[pos], target[pos + block_size]);
                pos += 1;
            }
        }
        push_literal(&mut ops, &target[literal_start..]);
    } else {
        push_literal(&mut ops, target);
    }

    token.check()?;
    report(target.len());

    Ok(Delta {
        source_len: source.len() as u64,
        target_len: total,
        target_hash: Hash::of(target),
        ops,
    })
}

fn push_literal(ops: &mut Vec<DeltaOp>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    if let Some(DeltaOp::Literal(existing)) = ops.last_mut() {
        existing.extend_from_slice(bytes);
        return;
    }
    ops.push(DeltaOp::Literal(bytes.to_vec()));
}

fn push_copy(ops: &mut Vec<DeltaOp>, offset: u64, len: u64) {
    if let Some(DeltaOp::Copy {
        offset: prev,
        len: prev_len,
    }) = ops.last_mut()
    {
        if *prev + *prev_len == offset {
            *prev_len += len;
            return;
        }
    }
    ops.push(DeltaOp::Copy { offset, len });
}

/// Decode `delta` and apply it to `source`.
pub fn apply(source: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    Delta::from_bytes(delta)?.apply(source)
}

impl Delta {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        let _ = self.write_to(&mut out);
        out
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&MAGIC)?;
        writer.write_u32::<LE>(FORMAT_VERSION)?;
        writer.write_u64::<LE>(self.source_len)?;
        writer.write_u64::<LE>(self.target_len)?;
        writer.write_u64::<LE>(self.target_hash.0)?;
        writer.write_u32::<LE>(self.ops.len() as u32)?;
        for op in &self.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    writer.write_u8(OP_COPY)?;
                    writer.write_u64::<LE>(*offset)?;
                    writer.write_u64::<LE>(*len)?;
                }
                DeltaOp::Literal(bytes) => {
                    writer.write_u8(OP_LITERAL)?;
                    writer.write_u64::<LE>(bytes.len() as u64)?;
                    writer.write_all(bytes)?;
                }
            }
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let truncated = |_: io::Error| Error::malformed("truncated delta");

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(truncated)?;
        if magic != MAGIC {
            return Err(Error::malformed(format!("bad magic {:02x?}", magic)));
        }
        let version = reader.read_u32::<LE>().map_err(truncated)?;
        if version != FORMAT_VERSION {
            return Err(Error::malformed(format!("unsupported version {}", version)));
        }

        let source_len = reader.read_u64::<LE>().map_err(truncated)?;
        let target_len = reader.read_u64::<LE>().map_err(truncated)?;
        let target_hash = Hash(reader.read_u64::<LE>().map_err(truncated)?);
        let op_count = reader.read_u32::<LE>().map_err(truncated)?;

        let mut ops = Vec::with_capacity(op_count.min(1 << 16) as usize);
        for _ in 0..op_count {
            match reader.read_u8().map_err(truncated)? {
                OP_COPY => {
                    let offset = reader.read_u64::<LE>().map_err(truncated)?;
                    let len = reader.read_u64::<LE>().map_err(truncated)?;
                    ops.push(DeltaOp::Copy { offset, len });
                }
                OP_LITERAL => {
                    let len = reader.read_u64::<LE>().map_err(truncated)?;
                    let remaining = bytes.len() as u64 - reader.position();
                    if len > remaining {
                        return Err(Error::malformed("literal runs past end of delta"));
                    }
                    let mut data = vec![0u8; len as usize];
                    reader.read_exact(&mut data).map_err(truncated)?;
                    ops.push(DeltaOp::Literal(data));
                }
                other => return Err(Error::malformed(format!("unknown op {}", other))),
            }
        }

        Ok(Self {
            source_len,
            target_len,
            target_hash,
            ops,
        })
    }

    /// Rebuild the target from `source`, verifying length and hash.
    pub fn apply(&self, source: &[u8]) -> Result<Vec<u8>> {
        if source.len() as u64 != self.source_len {
            return Err(Error::malformed(format!(
                "source is {} bytes, delta expects {}",
                source.len(),
                self.source_len
            )));
        }

        let mut out = Vec::with_capacity(self.target_len.min(1 << 30) as usize);
        for op in &self.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    let range = offset
                        .checked_add(*len)
                        .filter(|end| *end <= source.len() as u64)
                        .map(|end| *offset as usize..end as usize)
                        .ok_or_else(|| Error::malformed("copy outside source"))?;
                    out.extend_from_slice(&source[range]);
                }
                DeltaOp::Literal(bytes) => out.extend_from_slice(bytes),
            }
        }

        if out.len() as u64 != self.target_len {
            return Err(Error::malformed(format!(
                "produced {} bytes, expected {}",
                out.len(),
                self.target_len
            )));
        }
        let actual = Hash::of(&out);
        if actual != self.target_hash {
            return Err(Error::HashMismatch {
                expected: self.target_hash,
                actual,
            });
        }
        Ok(out)
    }

    /// Number of bytes taken from the source.
    pub fn copied_len(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Copy { len, .. } => *len,
                DeltaOp::Literal(_) => 0,
            })
            .sum()
    }

    fn encoded_len(&self) -> usize {
        4 + 4 + 8 * 3
            + 4
            + self
                .ops
                .iter()
                .map(|op| match op {
                    DeltaOp::Copy { .. } => 17,
                    DeltaOp::Literal(bytes) => 9 + bytes.len(),
                })
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn roundtrip(source: &[u8], target: &[u8]) -> Delta {
        let delta = diff(source, target, None, &CancellationToken::new()).unwrap();
        assert_eq!(apply(source, &delta.to_bytes()).unwrap(), target);
        delta
    }

    #[test]
    fn test_rolling_matches_fresh_digest() {
        let data = noise(4096, 1);
        let window = 700;
        let mut rolling = Rolling::new(&data[..window]);
        for pos in 0..data.len() - window {
            rolling.roll(data[pos], data[pos + window]);
            assert_eq!(
                rolling.digest(),
                Rolling::new(&data[pos + 1..pos + 1 + window]).digest()
            );
        }
    }

    #[test]
    fn test_insertion_reuses_source_blocks() {
        let source = noise(200_000, 2);
        let mut target = source[..100_000].to_vec();
        target.extend_from_slice(b"a few inserted bytes");
        target.extend_from_slice(&source[100_000..]);

        let delta = roundtrip(&source, &target);
        let literal: usize = delta
            .ops
            .iter()
            .map(|op| match op {
                DeltaOp::Literal(b) => b.len(),
                DeltaOp::Copy { .. } => 0,
            })
            .sum();
        assert!(literal < 2 * block_size_for(source.len()));
        assert!(delta.to_bytes().len() < target.len() / 10);
    }

    #[test]
    fn test_identical_is_one_copy() {
        let source = noise(50_000, 3);
        let delta = roundtrip(&source, &source);
        let block = block_size_for(source.len());
        let whole = (source.len() / block * block) as u64;
        assert_eq!(delta.ops[0], DeltaOp::Copy { offset: 0, len: whole });
        assert_eq!(delta.copied_len(), whole);
    }

    #[test]
    fn test_empty_inputs() {
        roundtrip(b"", b"");
        roundtrip(b"", b"brand new file");
        roundtrip(&noise(5000, 4), b"");
    }

    #[test]
    fn test_wrong_source_is_rejected() {
        let source = noise(10_000, 5);
        let target = noise(10_000, 6);
        let delta = diff(&source, &target, None, &CancellationToken::new())
            .unwrap()
            .to_bytes();
        let other = noise(9_000, 7);
        assert!(matches!(
            apply(&other, &delta),
            Err(Error::PatchApplicationFailure(_))
        ));
    }

    #[test]
    fn test_tampered_literal_is_hash_mismatch() {
        let target = b"plugin version two".to_vec();
        let mut delta = diff(b"", &target, None, &CancellationToken::new())
            .unwrap()
            .to_bytes();
        let last = delta.len() - 1;
        delta[last] ^= 0xff;
        assert!(matches!(apply(b"", &delta), Err(Error::HashMismatch { .. })));
    }

    #[test]
    fn test_truncated_and_garbage_deltas() {
        let delta = diff(b"", b"abc", None, &CancellationToken::new())
            .unwrap()
            .to_bytes();
        assert!(apply(b"", &delta[..delta.len() - 2]).is_err());
        assert!(matches!(
            apply(b"", b"NOPE0000"),
            Err(Error::PatchApplicationFailure(_))
        ));
    }

    #[test]
    fn test_progress_and_cancellation() {
        let source = noise(100_000, 8);
        let target = noise(100_000, 9);
        let last = Arc::new(AtomicU64::new(0));
        let seen = last.clone();
        let progress: ByteProgressCallback = Arc::new(move |p: ByteProgress| {
            seen.store(p.done, Ordering::SeqCst);
        });
        diff(&source, &target, Some(&progress), &CancellationToken::new()).unwrap();
        assert_eq!(last.load(Ordering::SeqCst), target.len() as u64);

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            diff(&source, &target, None, &token),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_cancelled_partway_through_diff() {
        let source = noise(100_000, 10);
        let target = noise(100_000, 11);
        let token = CancellationToken::new();
        let furthest = Arc::new(AtomicU64::new(0));

        let canceller = token.clone();
        let seen = furthest.clone();
        let progress: ByteProgressCallback = Arc::new(move |p: ByteProgress| {
            seen.fetch_max(p.done, Ordering::SeqCst);
            if p.done >= p.total / 2 {
                canceller.cancel();
            }
        });

        assert!(matches!(
            diff(&source, &target, Some(&progress), &token),
            Err(Error::Cancelled)
        ));
        let stopped_at = furthest.load(Ordering::SeqCst);
        assert!(stopped_at >= target.len() as u64 / 2);
        assert!(stopped_at < target.len() as u64);
    }

    proptest! {
        #[test]
        fn test_apply_reconstructs_target(
            source in proptest::collection::vec(any::<u8>(), 0..6000),
            insert in proptest::collection::vec(any::<u8>(), 0..300),
            cut in 0usize..6000,
            keep_tail in any::<bool>(),
        ) {
            let cut = cut.min(source.len());
            let mut target = source[cut..].to_vec();
            target.extend_from_slice(&insert);
            if keep_tail {
                target.extend_from_slice(&source[..cut]);
            }
            let delta = diff(&source, &target, None, &CancellationToken::new()).unwrap();
            prop_assert_eq!(apply(&source, &delta.to_bytes()).unwrap(), target);
        }
    }
}
