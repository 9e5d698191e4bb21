use crate::error::Result;
use crate::step::{CompilationStep, CompileContext, Resolution, SourceFile};
use mlk_recipe::DirectiveKind;

/// Drops files excluded by the configured ignore rules.
pub struct ApplyIgnoreRules;

impl CompilationStep for ApplyIgnoreRules {
    fn name(&self) -> &'static str {
        "ApplyIgnoreRules"
    }

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        Ok(ctx.ignore.reason(&file.path).map(|reason| {
            tracing::trace!("{}: {}", file.path, reason);
            Resolution::new(file.directive(DirectiveKind::IgnoredDirectly { reason }))
        }))
    }
}
