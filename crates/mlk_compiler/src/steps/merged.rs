use crate::error::Result;
use crate::step::{CompilationStep, CompileContext, Resolution, SourceFile};
use mlk_core::Hash;
use mlk_recipe::{patch_data_id, DirectiveKind, SourcePatch};

/// Files configured as merges are rebuilt from the concatenation of their
/// sources plus a delta.
///
/// Whether every source ends up with a producing directive is checked once all
/// files are resolved, see [`Compiler::compile`](crate::Compiler::compile).
pub struct IncludeMergedPatches;

impl CompilationStep for IncludeMergedPatches {
    fn name(&self) -> &'static str {
        "IncludeMergedPatches"
    }

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        let Some(merge) = ctx.settings.merges.iter().find(|m| m.to == file.path) else {
            return Ok(None);
        };

        let mut joined = Vec::new();
        let mut sources = Vec::with_capacity(merge.sources.len());
        for path in &merge.sources {
            let Some(source) = ctx.file(path) else {
                let reason = format!("merge source {} is not part of the install", path);
                return Ok(Some(Resolution::new(
                    file.directive(DirectiveKind::NoMatch { reason }),
                )));
            };
            joined.extend_from_slice(&source.read()?);
            sources.push(SourcePatch {
                relative_path: path.clone(),
                hash: source.hash,
            });
        }

        let from = Hash::of(&joined);
        let target = file.read()?;
        let (entry, data) = ctx
            .patches
            .create_verified_patch(from, &joined, file.hash, &target, None, ctx.token)?;
        let patch_id = patch_data_id(from, file.hash);

        tracing::debug!(
            "{} merged from {} sources ({} byte delta)",
            file.path,
            sources.len(),
            entry.patch_size
        );
        Ok(Some(
            Resolution::new(file.directive(DirectiveKind::MergedPatch {
                sources,
                patch_id: patch_id.clone(),
            }))
            .with_data(patch_id, data),
        ))
    }
}
