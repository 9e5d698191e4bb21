//! Binary deltas between versions of a file, and a content-keyed cache of them.
//!
//! When an installed file differs from every file in the archive pool, the compiler
//! stores a delta from a similar pool file instead of the file itself. The installer
//! later replays that delta against the same pool file.
//!
//! # Example
//!
//! ```no_run
//! use mlk_core::{CancellationToken, Hash};
//! use mlk_patch::BinaryPatchCache;
//!
//! # fn main() -> mlk_patch::Result<()> {
//! let cache = BinaryPatchCache::open("cache/patches")?;
//! let (old, new) = (b"plugin v1".to_vec(), b"plugin v2".to_vec());
//!
//! let entry = cache.create_patch(
//!     Hash::of(&old), &old,
//!     Hash::of(&new), &new,
//!     None, &CancellationToken::new(),
//! )?;
//! let rebuilt = cache.apply_verified(&old, &entry, Hash::of(&new))?;
//! assert_eq!(rebuilt, new);
//! # cache.close()
//! # }
//! ```

pub mod cache;
pub mod delta;
pub mod error;

pub use cache::{BinaryPatchCache, CacheEntry};
pub use delta::{apply, diff, Delta, DeltaOp};
pub use error::{Error, Result};
