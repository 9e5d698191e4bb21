use crate::errors::CliError;
use crate::println_pad;
use crate::utils::config::AppConfig;
use crate::utils::{format_size, Caches};
use camino::Utf8PathBuf;
use colored::Colorize;
use mlk_compiler::{CompileStage, Compiler, CompilerSettings};
use mlk_core::CancellationToken;
use mlk_recipe::PACKAGE_EXTENSION;
use std::sync::Mutex;

pub struct CompileModlistArgs {
    pub source_dir: String,
    pub downloads_dir: Option<String>,
    pub output: Option<String>,
    pub profile: Option<String>,
    pub name: Option<String>,
    pub game: Option<String>,
    pub author: Option<String>,
    pub version: Option<String>,
    pub game_dir: Option<String>,
    pub ignore: Vec<String>,
    pub include: Vec<String>,
    pub max_inline_size: Option<u64>,
    pub no_texture_matching: bool,
}

/// Merge the profile, the application config and the flags, in that order.
fn build_settings(args: CompileModlistArgs, cfg: &AppConfig) -> Result<CompilerSettings, CliError> {
    let mut settings = match &args.profile {
        Some(profile) => {
            let path = Utf8PathBuf::from(profile);
            let content = std::fs::read_to_string(path.as_std_path())?;
            toml::from_str(&content).map_err(|e| CliError::config_parse_error(path, e))?
        }
        None => CompilerSettings::default(),
    };

    settings.source_dir = Utf8PathBuf::from(&args.source_dir);
    settings.downloads_dir = args
        .downloads_dir
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| settings.source_dir.join("downloads"));
    if let Some(name) = args.name {
        settings.name = name;
    }
    if settings.name.is_empty() {
        settings.name = settings
            .source_dir
            .file_name()
            .unwrap_or("modlist")
            .to_string();
    }
    settings.output = args
        .output
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| Utf8PathBuf::from(format!("{}.{}", settings.name, PACKAGE_EXTENSION)));
    if let Some(game) = args.game {
        settings.game = game;
    }
    if let Some(author) = args.author {
        settings.author = author;
    }
    if let Some(version) = args.version {
        settings.version = version;
    }
    if let Some(game_dir) = args.game_dir {
        settings.game_dir = Some(Utf8PathBuf::from(game_dir));
    }
    settings.ignore.in_path.extend(args.ignore);
    settings.include_regex.extend(args.include);
    if let Some(size) = args.max_inline_size.or(cfg.max_inline_size) {
        settings.max_inline_size = size;
    }
    if args.no_texture_matching {
        settings.recompress_textures = false;
    }
    if cfg.workers > 0 {
        settings.workers = cfg.workers;
    }
    Ok(settings)
}

pub fn compile_modlist(args: CompileModlistArgs, cfg: &AppConfig) -> miette::Result<()> {
    let settings = build_settings(args, cfg)?;
    let caches = Caches::open(cfg)?;

    println_pad!(
        "{} {}",
        "🛠️  Compiling:".bright_blue().bold(),
        settings.name.bright_cyan().bold()
    );
    println_pad!(
        "{} {}",
        "📁 Source:".bright_yellow(),
        settings.source_dir.as_str().bright_white()
    );
    println_pad!(
        "{} {}",
        "📦 Downloads:".bright_yellow(),
        settings.downloads_dir.as_str().bright_white()
    );

    let last_stage = Mutex::new(None);
    let compiler = Compiler::new(settings, caches.vfs.clone(), caches.patches.clone()).with_progress(
        move |progress| {
            let Ok(mut last) = last_stage.lock() else {
                return;
            };
            if *last == Some(progress.stage) {
                return;
            }
            *last = Some(progress.stage);
            let label = match progress.stage {
                CompileStage::IndexingArchives => "Indexing archives",
                CompileStage::HashingFiles => "Hashing installed files",
                CompileStage::Matching => "Matching files",
                CompileStage::WritingRecipe => "Writing recipe",
                CompileStage::Complete => return,
            };
            println_pad!("{} {}", "→".bright_cyan(), label.bright_white());
        },
    );

    let report = compiler.compile(&CancellationToken::new());
    caches.close()?;
    let report = report.map_err(CliError::from)?;

    if !report.pool_failures.is_empty() {
        println_pad!("\n{}", "⚠️  Archives left out of the pool:".bright_yellow().bold());
        for rejection in &report.pool_failures {
            println_pad!(
                "   {} {} {}",
                "•".bright_yellow(),
                rejection.path.as_str().bright_white(),
                format!("({})", rejection.reason).dimmed()
            );
        }
    }

    println_pad!("\n{}", "🧾 Directives:".bright_magenta().bold());
    for (kind, count) in &report.by_type {
        println_pad!("   {} {} {}", "•".bright_cyan(), kind.bright_cyan().bold(), count);
    }
    println_pad!(
        "{} {} archives, {} ignored files",
        "📚".bright_white(),
        report.archives.len(),
        report.ignored.len()
    );

    if !report.no_matches.is_empty() {
        println_pad!("\n{}", "❌ Unmatched files:".bright_red().bold());
        for unresolved in &report.no_matches {
            println_pad!(
                "   {} {} {}",
                "•".bright_red(),
                unresolved.path.as_str().bright_white(),
                format!("({})", unresolved.reason).dimmed()
            );
        }
        return Err(CliError::UnresolvedFiles {
            count: report.no_matches.len(),
        }
        .into());
    }

    if let Some(path) = &report.recipe_path {
        let size = std::fs::metadata(path.as_std_path()).map(|m| m.len()).unwrap_or(0);
        println_pad!(
            "\n{} {} {}",
            "✅ Recipe written to".bright_green().bold(),
            path.as_str().bright_white().bold(),
            format!("({}, {:.2?})", format_size(size), report.elapsed).dimmed()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(source: &str) -> CompileModlistArgs {
        CompileModlistArgs {
            source_dir: source.to_string(),
            downloads_dir: None,
            output: None,
            profile: None,
            name: None,
            game: Some("skyrimse".to_string()),
            author: None,
            version: None,
            game_dir: None,
            ignore: vec!["overwrite/".to_string()],
            include: Vec::new(),
            max_inline_size: None,
            no_texture_matching: false,
        }
    }

    #[test]
    fn test_defaults_follow_source_dir() {
        let settings = build_settings(args("/lists/Ultimate"), &AppConfig::default()).unwrap();
        assert_eq!(settings.name, "Ultimate");
        assert_eq!(settings.downloads_dir, Utf8PathBuf::from("/lists/Ultimate/downloads"));
        assert_eq!(settings.output, Utf8PathBuf::from("Ultimate.mlk"));
        assert!(settings.ignore.in_path.contains(&"overwrite/".to_string()));
    }

    #[test]
    fn test_flags_override_config_and_profile() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("profile.toml");
        std::fs::write(&profile, "name = \"From Profile\"\nmaxInlineSize = 10\n").unwrap();

        let cfg = AppConfig {
            max_inline_size: Some(20),
            workers: 3,
            ..AppConfig::default()
        };
        let mut a = args("/lists/Ultimate");
        a.profile = Some(profile.to_str().unwrap().to_string());
        let settings = build_settings(a, &cfg).unwrap();
        assert_eq!(settings.name, "From Profile");
        assert_eq!(settings.max_inline_size, 20);
        assert_eq!(settings.workers, 3);

        let mut a = args("/lists/Ultimate");
        a.max_inline_size = Some(30);
        a.no_texture_matching = true;
        let settings = build_settings(a, &cfg).unwrap();
        assert_eq!(settings.max_inline_size, 30);
        assert!(!settings.recompress_textures);
    }
}
