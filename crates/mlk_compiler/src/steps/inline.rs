use crate::error::Result;
use crate::step::{CompilationStep, CompileContext, Resolution, SourceFile};
use crate::steps::include::inline;
use mlk_recipe::DirectiveKind;

/// Last resort: ship small untraceable files inside the package and reject the
/// rest.
pub struct InlineSmallFiles;

impl CompilationStep for InlineSmallFiles {
    fn name(&self) -> &'static str {
        "InlineSmallFiles"
    }

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        if file.size <= ctx.settings.max_inline_size {
            return inline(file, ctx).map(Some);
        }
        let reason = format!(
            "file too large to inline ({} bytes, limit {})",
            file.size, ctx.settings.max_inline_size
        );
        Ok(Some(Resolution::new(file.directive(DirectiveKind::NoMatch { reason }))))
    }
}

/// Terminal step for custom stacks that stop short of inlining.
pub struct DropAll;

impl CompilationStep for DropAll {
    fn name(&self) -> &'static str {
        "DropAll"
    }

    fn run(&self, file: &SourceFile, _ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        Ok(Some(Resolution::new(file.directive(DirectiveKind::NoMatch {
            reason: "no match in the archive pool".to_string(),
        }))))
    }
}
