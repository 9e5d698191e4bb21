//! The matching stack.
//!
//! Order matters: cheap exact outcomes come first, expensive or lossy ones last.
//!
//! | Step                      | Emits                                |
//! |---------------------------|--------------------------------------|
//! | [`ApplyIgnoreRules`]      | `IgnoredDirectly`                    |
//! | [`IncludeMergedPatches`]  | `MergedPatch`                        |
//! | [`IncludeStubbedConfigs`] | `RemappedInlineFile`                 |
//! | [`DirectMatch`]           | `FromArchive`                        |
//! | [`DeconstructContainers`] | `CreateBSA` plus staged members      |
//! | [`MatchSimilarTextures`]  | `TransformedTexture`                 |
//! | [`IncludePatches`]        | `PatchedFromArchive`                 |
//! | [`IncludeRegex`]          | `InlineFile` or `RemappedInlineFile` |
//! | [`InlineSmallFiles`]      | `InlineFile` or `NoMatch`            |
//! | [`DropAll`]               | `NoMatch`                            |

mod containers;
mod direct;
mod ignore;
mod include;
mod inline;
mod merged;
mod patches;
mod textures;

pub use containers::DeconstructContainers;
pub use direct::DirectMatch;
pub use ignore::ApplyIgnoreRules;
pub use include::{IncludeRegex, IncludeStubbedConfigs};
pub use inline::{DropAll, InlineSmallFiles};
pub use merged::IncludeMergedPatches;
pub use patches::IncludePatches;
pub use textures::MatchSimilarTextures;

use crate::error::Result;
use crate::settings::CompilerSettings;
use crate::step::CompilationStep;
use std::sync::Arc;

/// The standard stack for `settings`.
pub fn default_stack(settings: &CompilerSettings) -> Result<Vec<Arc<dyn CompilationStep>>> {
    Ok(vec![
        Arc::new(ApplyIgnoreRules),
        Arc::new(IncludeMergedPatches),
        Arc::new(IncludeStubbedConfigs),
        Arc::new(DirectMatch),
        Arc::new(DeconstructContainers),
        Arc::new(MatchSimilarTextures),
        Arc::new(IncludePatches),
        Arc::new(IncludeRegex::new(settings)?),
        Arc::new(InlineSmallFiles),
        Arc::new(DropAll),
    ])
}

/// The reduced stack run on container members.
pub(crate) fn member_stack() -> Vec<Arc<dyn CompilationStep>> {
    vec![
        Arc::new(DirectMatch),
        Arc::new(MatchSimilarTextures),
        Arc::new(IncludePatches),
    ]
}
