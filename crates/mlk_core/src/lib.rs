//! Shared primitives for the modlist-kit crates.
//!
//! Everything in the reconstruction pipeline is keyed by a [`Hash`] of exact file
//! content. A file nested inside archives is addressed by a [`HashPath`]: the hash
//! of the outermost archive followed by one [`RelativePath`] per nesting level.
//!
//! Long-running work (hashing, diffing, extraction) takes a [`CancellationToken`]
//! and checks it at fixed chunk boundaries, and reports byte-level progress through
//! a [`ByteProgressCallback`].
//!
//! # Example
//!
//! ```
//! use mlk_core::{CancellationToken, Hash, HashPath, RelativePath};
//!
//! # fn main() -> mlk_core::Result<()> {
//! let token = CancellationToken::new();
//! let hash = mlk_core::hash_reader(&b"hello"[..], &token, None)?;
//! assert_eq!(hash, Hash::of(b"hello"));
//!
//! let path = HashPath::new(hash).join(RelativePath::new("textures/t1.dds")?);
//! assert_eq!(path.depth(), 1);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod error;
pub mod fs;
pub mod hash;
pub mod path;
pub mod progress;

pub use cancel::CancellationToken;
pub use error::{Error, Result};
pub use hash::{copy_hashed, hash_file, hash_reader, ContentHasher, Hash, HASH_CHUNK_SIZE};
pub use path::{HashPath, RelativePath};
pub use progress::{ByteProgress, ByteProgressCallback};
