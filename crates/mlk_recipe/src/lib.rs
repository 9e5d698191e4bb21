//! The recipe: a portable description of an installed file set.
//!
//! A [`Recipe`] lists the [`ArchiveDescriptor`]s an installation needs and one
//! [`Directive`] per installed file. Recipes travel as a [`RecipePackage`], a zip
//! holding the recipe JSON together with any inlined files and patch deltas.

pub mod archive;
pub mod directive;
pub mod error;
pub mod package;
pub mod recipe;
pub mod remap;

pub use archive::{meta_path, ArchiveDescriptor, META_EXTENSION};
pub use directive::{inline_data_id, patch_data_id, Directive, DirectiveKind, SourcePatch, KNOWN_TYPES};
pub use error::{Error, Result};
pub use package::{DownloadMetadata, PackageBuilder, RecipePackage, PACKAGE_EXTENSION};
pub use recipe::{Recipe, FORMAT_VERSION, TEMP_BSA_DIR};
pub use remap::{has_tokens, RemapRoots};
