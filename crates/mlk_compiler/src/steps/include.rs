use crate::error::Result;
use crate::settings::CompilerSettings;
use crate::step::{CompilationStep, CompileContext, Resolution, SourceFile};
use mlk_core::Hash;
use mlk_recipe::{inline_data_id, DirectiveKind};
use regex::Regex;

/// Config files that mention an install directory are stored with the directory
/// replaced by a token, so they can be rewritten for the installing machine.
pub struct IncludeStubbedConfigs;

impl CompilationStep for IncludeStubbedConfigs {
    fn name(&self) -> &'static str {
        "IncludeStubbedConfigs"
    }

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        if !ctx.settings.is_config(&file.path) {
            return Ok(None);
        }
        let bytes = file.read()?;
        Ok(tokenized(&bytes, ctx).map(|text| remapped(file, text)))
    }
}

/// Inlines files the user asked to keep verbatim.
pub struct IncludeRegex {
    patterns: Vec<Regex>,
}

impl IncludeRegex {
    pub fn new(settings: &CompilerSettings) -> Result<Self> {
        let patterns = settings
            .include_regex
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<_, _>>()?;
        Ok(Self { patterns })
    }

    fn selects(&self, file: &SourceFile, settings: &CompilerSettings) -> bool {
        self.patterns.iter().any(|re| re.is_match(file.path.as_str()))
            || (settings.include_all_configs && settings.is_config(&file.path))
    }
}

impl CompilationStep for IncludeRegex {
    fn name(&self) -> &'static str {
        "IncludeRegex"
    }

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        if !self.selects(file, ctx.settings) {
            return Ok(None);
        }
        inline(file, ctx).map(Some)
    }
}

/// Inline `file`, tokenizing install paths when it is a config.
pub(crate) fn inline(file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Resolution> {
    let bytes = file.read()?;
    if ctx.settings.is_config(&file.path) {
        if let Some(text) = tokenized(&bytes, ctx) {
            return Ok(remapped(file, text));
        }
    }
    let id = inline_data_id(file.hash);
    Ok(Resolution::new(file.directive(DirectiveKind::InlineFile {
        source_data_id: id.clone(),
    }))
    .with_data(id, bytes))
}

fn tokenized(bytes: &[u8], ctx: &CompileContext<'_>) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    ctx.remap.tokenize(text)
}

fn remapped(file: &SourceFile, text: String) -> Resolution {
    let bytes = text.into_bytes();
    let id = inline_data_id(Hash::of(&bytes));
    tracing::debug!("{} embeds install paths; storing tokenized copy", file.path);
    Resolution::new(file.directive(DirectiveKind::RemappedInlineFile {
        source_data_id: id.clone(),
    }))
    .with_data(id, bytes)
}
