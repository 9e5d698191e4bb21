use crate::error::Result;
use crate::step::{CompilationStep, CompileContext, Resolution, SourceFile};
use mlk_recipe::DirectiveKind;

/// Exact content match anywhere in the pool.
///
/// The index orders occurrences shallowest first, then by most recently modified
/// root archive, so the chosen source is stable across runs.
pub struct DirectMatch;

impl CompilationStep for DirectMatch {
    fn name(&self) -> &'static str {
        "DirectMatch"
    }

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        Ok(ctx.index.best_match(file.hash).map(|found| {
            tracing::trace!("{} found at {}", file.path, found.hash_path);
            Resolution::new(file.directive(DirectiveKind::FromArchive {
                archive_hash_path: found.hash_path.clone(),
            }))
        }))
    }
}
