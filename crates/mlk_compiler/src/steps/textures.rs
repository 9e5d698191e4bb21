use crate::error::Result;
use crate::step::{CompilationStep, CompileContext, Resolution, SourceFile};
use mlk_recipe::DirectiveKind;
use mlk_vfs::IndexedFile;
use std::sync::Arc;

/// Recognizes textures that were re-encoded (resized, recompressed) from a pool
/// texture with the same stem.
///
/// Only active when an [`ImageAnalyzer`](mlk_vfs::ImageAnalyzer) is configured
/// and `recompress_textures` is on. The output is not byte-exact, so the
/// installer checks its size rather than its hash.
pub struct MatchSimilarTextures;

impl CompilationStep for MatchSimilarTextures {
    fn name(&self) -> &'static str {
        "MatchSimilarTextures"
    }

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        if !ctx.settings.recompress_textures {
            return Ok(None);
        }
        let Some(analyzer) = ctx.image_analyzer else {
            return Ok(None);
        };
        if !analyzer.can_analyze(file.path.file_name()) {
            return Ok(None);
        }
        let candidates = ctx.images_with_stem(file.path.file_stem());
        if candidates.is_empty() {
            return Ok(None);
        }
        let Some(state) = analyzer.analyze(&file.bytes)? else {
            return Ok(None);
        };

        // Strictly greater keeps the earlier (preferred) candidate on ties.
        let mut best: Option<(f32, &Arc<IndexedFile>)> = None;
        for candidate in candidates {
            let Some(other) = &candidate.image_state else {
                continue;
            };
            let score = analyzer.similarity(&state, other);
            if score >= ctx.settings.similarity_threshold
                && best.map_or(true, |(top, _)| score > top)
            {
                best = Some((score, candidate));
            }
        }

        Ok(best.map(|(score, found)| {
            tracing::debug!(
                "{} resembles {} (similarity {:.2})",
                file.path,
                found.hash_path,
                score
            );
            Resolution::new(file.directive(DirectiveKind::TransformedTexture {
                archive_hash_path: found.hash_path.clone(),
                image_state: state,
            }))
        }))
    }
}
