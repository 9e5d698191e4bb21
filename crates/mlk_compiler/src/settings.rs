use crate::error::{Error, Result};
use camino::Utf8PathBuf;
use mlk_core::RelativePath;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Files above this size are never inlined.
pub const DEFAULT_MAX_INLINE_SIZE: u64 = 1024 * 1024;

/// Minimum perceptual similarity for a texture to count as a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.80;

/// Everything a compile needs to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilerSettings {
    /// The installed setup to describe.
    pub source_dir: Utf8PathBuf,
    /// The archive pool. Each archive needs a `<archive>.meta` sidecar.
    pub downloads_dir: Utf8PathBuf,
    /// Where the recipe package is written.
    pub output: Utf8PathBuf,
    /// Game installation, used for path remapping only.
    pub game_dir: Option<Utf8PathBuf>,

    pub game: String,
    pub name: String,
    pub author: String,
    pub description: String,
    pub version: String,

    pub max_inline_size: u64,
    pub ignore: IgnoreRules,
    /// Paths matching any of these patterns are inlined.
    pub include_regex: Vec<String>,
    /// Inline every config file that reaches the include step.
    pub include_all_configs: bool,
    /// Extensions treated as text configs, lowercase without the dot.
    pub config_extensions: Vec<String>,
    pub merges: Vec<MergeSpec>,
    /// Allow perceptual texture matches (needs an image analyzer).
    pub recompress_textures: bool,
    pub similarity_threshold: f32,

    /// Matching threads; `0` uses one per CPU.
    pub workers: usize,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            source_dir: Utf8PathBuf::new(),
            downloads_dir: Utf8PathBuf::new(),
            output: Utf8PathBuf::new(),
            game_dir: None,
            game: String::new(),
            name: String::new(),
            author: String::new(),
            description: String::new(),
            version: "1.0.0".to_string(),
            max_inline_size: DEFAULT_MAX_INLINE_SIZE,
            ignore: IgnoreRules::default(),
            include_regex: Vec::new(),
            include_all_configs: true,
            config_extensions: ["ini", "cfg", "json", "toml", "yaml", "yml", "xml", "txt"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            merges: Vec::new(),
            recompress_textures: true,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            workers: 0,
        }
    }
}

impl CompilerSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.source_dir.is_dir() {
            return Err(Error::InvalidSettings(format!(
                "source directory {} does not exist",
                self.source_dir
            )));
        }
        if !self.downloads_dir.is_dir() {
            return Err(Error::InvalidSettings(format!(
                "downloads directory {} does not exist",
                self.downloads_dir
            )));
        }
        if self.output.as_str().is_empty() {
            return Err(Error::InvalidSettings("no output path".to_string()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::InvalidSettings(format!(
                "similarity threshold {} is outside [0, 1]",
                self.similarity_threshold
            )));
        }
        Ok(())
    }

    pub fn is_config(&self, path: &RelativePath) -> bool {
        path.extension().is_some_and(|ext| {
            self.config_extensions
                .iter()
                .any(|c| c.eq_ignore_ascii_case(ext))
        })
    }
}

/// Installed files excluded from the recipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IgnoreRules {
    /// Path prefixes, e.g. `overwrite/` or `profiles/Default/saves`.
    pub in_path: Vec<String>,
    /// Substrings anywhere in the path.
    pub path_contains: Vec<String>,
    pub regex: Vec<String>,
    /// Extensions without the dot.
    pub extensions: Vec<String>,
}

/// An installed file produced by concatenating other installed files and patching
/// the result, such as a merged plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSpec {
    pub to: RelativePath,
    pub sources: Vec<RelativePath>,
}

/// [`IgnoreRules`] ready for matching.
#[derive(Debug)]
pub(crate) struct CompiledIgnore {
    in_path: Vec<String>,
    path_contains: Vec<String>,
    regex: Vec<Regex>,
    extensions: Vec<String>,
}

impl CompiledIgnore {
    pub(crate) fn new(rules: &IgnoreRules) -> Result<Self> {
        let lower = |v: &[String]| -> Vec<String> { v.iter().map(|s| s.to_ascii_lowercase()).collect() };
        Ok(Self {
            in_path: rules
                .in_path
                .iter()
                .map(|p| p.replace('\\', "/").to_ascii_lowercase())
                .collect(),
            path_contains: lower(&rules.path_contains),
            regex: rules
                .regex
                .iter()
                .map(|r| Regex::new(r))
                .collect::<std::result::Result<_, _>>()?,
            extensions: rules
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        })
    }

    /// Reason the path is ignored, if any rule applies.
    pub(crate) fn reason(&self, path: &RelativePath) -> Option<String> {
        let lower = path.as_str().to_ascii_lowercase();
        if let Some(prefix) = self.in_path.iter().find(|p| lower.starts_with(p.as_str())) {
            return Some(format!("ignored because path starts with '{}'", prefix));
        }
        if let Some(part) = self.path_contains.iter().find(|p| lower.contains(p.as_str())) {
            return Some(format!("ignored because path contains '{}'", part));
        }
        if let Some(re) = self.regex.iter().find(|r| r.is_match(path.as_str())) {
            return Some(format!("ignored because path matches /{}/", re.as_str()));
        }
        let ext = path.extension().map(str::to_ascii_lowercase)?;
        self.extensions
            .iter()
            .find(|e| **e == ext)
            .map(|e| format!("ignored extension .{}", e))
    }
}
