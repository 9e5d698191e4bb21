//! Compiles an installed mod setup into a recipe.
//!
//! Every installed file is traced back to the archive pool by an ordered stack of
//! [`CompilationStep`]s: exact content matches first, then container
//! deconstruction, similar textures and binary patches, and finally inlining. The
//! resulting [`Directive`](mlk_recipe::Directive)s, the archives they read from,
//! and any inlined or patch data are written as one recipe package.
//!
//! # Example
//!
//! ```no_run
//! use mlk_compiler::{Compiler, CompilerSettings};
//! use mlk_core::CancellationToken;
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
//! let settings = CompilerSettings {
//!     source_dir: "C:/Modding/MyList".into(),
//!     downloads_dir: "C:/Modding/MyList/downloads".into(),
//!     output: "MyList.mlk".into(),
//!     name: "My List".to_string(),
//!     game: "skyrimse".to_string(),
//!     ..CompilerSettings::default()
//! };
//!
//! let report = Compiler::new(settings, Arc::new(vfs), Arc::new(patches))
//!     .with_progress(|p| println!("{:?} {}/{}", p.stage, p.current, p.total))
//!     .compile(&CancellationToken::new())?;
//! for unresolved in &report.no_matches {
//!     eprintln!("{}: {}", unresolved.path, unresolved.reason);
//! }
//! # Ok(())
//! # }
//! ```

pub mod candidates;
pub mod compiler;
pub mod error;
pub mod settings;
pub mod step;
pub mod steps;

pub use candidates::{levenshtein, NameSimilarityStrategy, PatchCandidateStrategy};
pub use compiler::{
    CompileProgress, CompileReport, CompileStage, Compiler, IgnoredFile, PoolRejection,
    UnresolvedFile, META_EXTENSION,
};
pub use error::{Error, Result};
pub use settings::{
    CompilerSettings, IgnoreRules, MergeSpec, DEFAULT_MAX_INLINE_SIZE, DEFAULT_SIMILARITY_THRESHOLD,
};
pub use step::{CompilationStep, CompileContext, ContainerSupport, Resolution, SourceFile};
pub use steps::default_stack;
