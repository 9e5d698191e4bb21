//! Content-addressed virtual file system over download archives.
//!
//! A [`Context`] indexes a pool of archives into trees of [`VirtualFile`]s, recursing
//! into archives nested inside archives. Every file anywhere in the pool can then be
//! found by content [`Hash`](mlk_core::Hash) or by name through the [`IndexRoot`], and
//! streamed back out with [`Context::resolve`] given its [`HashPath`](mlk_core::HashPath).
//!
//! Expanded archive trees are persisted in a [`VfsCache`] keyed by archive hash, and
//! file hashes are memoized per path in a [`FileHashCache`], so re-indexing an
//! unchanged pool reads almost nothing.
//!
//! # Example
//!
//! ```no_run
//! use camino::Utf8PathBuf;
//! use mlk_core::CancellationToken;
//! use mlk_vfs::{Context, FileHashCache, VfsCache, VfsSettings};
//! use std::sync::Arc;
//!
//! # fn main() -> mlk_vfs::Result<()> {
//! let cache = Arc::new(VfsCache::open("cache/vfs")?);
//! let hashes = Arc::new(FileHashCache::open("cache/file_hashes.bin")?);
//! let context = Context::new(cache, hashes, VfsSettings::default())?;
//!
//! let report = context.add_roots(&[Utf8PathBuf::from("downloads")], &CancellationToken::new())?;
//! println!("indexed {} archives", report.indexed.len());
//!
//! let index = context.index_root();
//! for file in index.files_named("plugin.esp") {
//!     println!("{} ({})", file.hash_path, file.hash);
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod context;
pub mod error;
pub mod file;
pub mod hash_cache;
pub mod index;
pub mod source;
pub mod zip_codec;

pub use archive::{
    ArchiveReader, ContainerCodec, ContainerState, EntryHandle, ImageAnalyzer, ImageState,
    MemberState, WriteSeek, SNIFF_LEN,
};
pub use cache::VfsCache;
pub use context::{Context, IndexFailure, IndexReport, VfsSettings};
pub use error::{Error, Result};
pub use file::{VirtualEntry, VirtualFile};
pub use hash_cache::FileHashCache;
pub use index::{IndexRoot, IndexedFile, RootArchive};
pub use source::{ByteSource, ByteStream, ReadSeek, SpillWriter, DEFAULT_SPILL_THRESHOLD};
pub use zip_codec::ZipReader;
