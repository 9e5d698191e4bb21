use crate::error::{Error, Result};
use crate::step::{CompilationStep, CompileContext, Resolution, SourceFile};
use mlk_patch::CacheEntry;
use mlk_recipe::{patch_data_id, DirectiveKind};
use mlk_vfs::IndexedFile;
use std::sync::Arc;

/// Describes a modified file as a delta against a similar pool file.
///
/// Every candidate from the configured
/// [`PatchCandidateStrategy`](crate::PatchCandidateStrategy) is diffed and the
/// smallest delta wins. Candidates that fail to load or diff are skipped.
pub struct IncludePatches;

impl CompilationStep for IncludePatches {
    fn name(&self) -> &'static str {
        "IncludePatches"
    }

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        let candidates = ctx.candidates.candidates(file, &ctx.index);
        if candidates.is_empty() {
            return Ok(None);
        }
        let target = file.read()?;

        let mut best: Option<(CacheEntry, Vec<u8>, Arc<IndexedFile>)> = None;
        for candidate in candidates {
            ctx.token.check()?;
            let Some((entry, data)) = diff_against(&candidate, file, &target, ctx)? else {
                continue;
            };
            if best
                .as_ref()
                .map_or(true, |(current, _, _)| entry.patch_size < current.patch_size)
            {
                best = Some((entry, data, candidate));
            }
        }

        let Some((entry, data, base)) = best else {
            return Ok(None);
        };
        let patch_id = patch_data_id(entry.from, entry.to);
        tracing::debug!(
            "{} patched from {} ({} byte delta)",
            file.path,
            base.hash_path,
            entry.patch_size
        );
        Ok(Some(
            Resolution::new(file.directive(DirectiveKind::PatchedFromArchive {
                archive_hash_path: base.hash_path.clone(),
                from_hash: base.hash,
                patch_id: patch_id.clone(),
            }))
            .with_data(patch_id, data),
        ))
    }
}

/// Verified delta from `candidate` to `file`, or `None` if the candidate is
/// unusable.
fn diff_against(
    candidate: &IndexedFile,
    file: &SourceFile,
    target: &[u8],
    ctx: &CompileContext<'_>,
) -> Result<Option<(CacheEntry, Vec<u8>)>> {
    let source = match ctx.vfs.resolve_bytes(&candidate.hash_path, ctx.token) {
        Ok(bytes) => bytes,
        Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
        Err(e) => {
            tracing::warn!("Skipping patch base {} for {}: {}", candidate.hash_path, file.path, e);
            return Ok(None);
        }
    };
    match ctx
        .patches
        .create_verified_patch(candidate.hash, &source, file.hash, target, None, ctx.token)
    {
        Ok(verified) => Ok(Some(verified)),
        Err(e) if e.is_cancelled() => Err(Error::Cancelled),
        Err(e) => {
            tracing::warn!("Could not diff {} against {}: {}", file.path, candidate.hash_path, e);
            Ok(None)
        }
    }
}
