use crate::errors::CliError;
use crate::println_pad;
use crate::utils::config::AppConfig;
use crate::utils::Caches;
use camino::Utf8PathBuf;
use colored::Colorize;
use mlk_core::CancellationToken;
use mlk_installer::{InstallStage, Installer, InstallerSettings, LocalMirrorDownloader};
use std::sync::{Arc, Mutex};

pub struct InstallModlistArgs {
    pub package: String,
    pub install_dir: String,
    pub downloads_dir: Option<String>,
    pub game_dir: Option<String>,
    pub mirrors: Vec<String>,
    pub force: bool,
    pub keep_stale: bool,
}

fn build_settings(args: &InstallModlistArgs, cfg: &AppConfig) -> InstallerSettings {
    let install_dir = Utf8PathBuf::from(&args.install_dir);
    let downloads_dir = args
        .downloads_dir
        .as_ref()
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| install_dir.join("downloads"));

    let mut settings = InstallerSettings::new(&args.package, install_dir, downloads_dir);
    settings.game_dir = args.game_dir.as_ref().map(Utf8PathBuf::from);
    settings.workers = cfg.workers;
    settings.download_workers = cfg.download_workers;
    settings.skip_existing = !args.force;
    settings.remove_stale = !args.keep_stale;
    settings
}

fn mirror_dirs(args: &InstallModlistArgs, cfg: &AppConfig) -> Vec<Utf8PathBuf> {
    args.mirrors
        .iter()
        .map(Utf8PathBuf::from)
        .chain(cfg.mirrors.iter().cloned())
        .collect()
}

pub fn install_modlist(args: InstallModlistArgs, cfg: &AppConfig) -> miette::Result<()> {
    let settings = build_settings(&args, cfg);
    let mirrors = mirror_dirs(&args, cfg);
    let caches = Caches::open(cfg)?;

    println_pad!(
        "{} {}",
        "📦 Installing:".bright_blue().bold(),
        settings.package.as_str().bright_cyan().bold()
    );
    println_pad!(
        "{} {}",
        "📁 Into:".bright_yellow(),
        settings.install_dir.as_str().bright_white()
    );

    let mut installer = Installer::new(settings, caches.vfs.clone(), caches.patches.clone());
    if !mirrors.is_empty() {
        installer = installer.with_downloader(Arc::new(LocalMirrorDownloader::new(mirrors)));
    }
    let last_stage = Mutex::new(None);
    let installer = installer.with_progress(move |progress| {
        let Ok(mut last) = last_stage.lock() else {
            return;
        };
        if *last == Some(progress.stage) {
            return;
        }
        *last = Some(progress.stage);
        let label = match progress.stage {
            InstallStage::LoadingRecipe => "Loading recipe",
            InstallStage::HashingDownloads => "Checking downloaded archives",
            InstallStage::Downloading => "Downloading missing archives",
            InstallStage::Preparing => "Looking for files to remove or keep",
            InstallStage::Installing => "Installing files",
            InstallStage::CleaningUp => "Cleaning up",
            InstallStage::Complete => return,
        };
        println_pad!("{} {}", "→".bright_cyan(), label.bright_white());
    });

    let report = installer.install(&CancellationToken::new());
    caches.close()?;
    let report = report.map_err(CliError::from)?;

    for archive in &report.downloaded {
        println_pad!("   {} {}", "⬇".bright_cyan(), archive.bright_white());
    }
    for path in &report.removed {
        println_pad!(
            "   {} {} {}",
            "•".bright_yellow(),
            path.as_str().bright_white(),
            "(not part of this modlist, removed)".dimmed()
        );
    }
    for path in &report.unsupported {
        println_pad!(
            "   {} {} {}",
            "•".bright_yellow(),
            path.as_str().bright_white(),
            "(unsupported directive, skipped)".dimmed()
        );
    }

    if !report.failures.is_empty() {
        println_pad!("\n{}", "❌ Failed files:".bright_red().bold());
        for failure in &report.failures {
            println_pad!(
                "   {} {} {}",
                "•".bright_red(),
                failure.to.as_str().bright_white(),
                failure.reason.dimmed()
            );
        }
        return Err(CliError::InstallFailed {
            count: report.failures.len(),
        }
        .into());
    }

    println_pad!(
        "\n{} {} written, {} already in place {}",
        "✅ Install complete:".bright_green().bold(),
        report.written,
        report.skipped,
        format!("({:.2?})", report.elapsed).dimmed()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> InstallModlistArgs {
        InstallModlistArgs {
            package: "Ultimate.mlk".to_string(),
            install_dir: "/games/Ultimate".to_string(),
            downloads_dir: None,
            game_dir: None,
            mirrors: vec!["/mnt/a".to_string()],
            force: false,
            keep_stale: false,
        }
    }

    #[test]
    fn test_settings_from_args() {
        let cfg = AppConfig {
            workers: 4,
            download_workers: 2,
            mirrors: vec![Utf8PathBuf::from("/mnt/b")],
            ..AppConfig::default()
        };
        let settings = build_settings(&args(), &cfg);
        assert_eq!(settings.downloads_dir, Utf8PathBuf::from("/games/Ultimate/downloads"));
        assert!(settings.skip_existing);
        assert!(settings.remove_stale);
        assert_eq!((settings.workers, settings.download_workers), (4, 2));

        let mirrors = mirror_dirs(&args(), &cfg);
        assert_eq!(mirrors, vec![Utf8PathBuf::from("/mnt/a"), Utf8PathBuf::from("/mnt/b")]);

        let mut forced = args();
        forced.force = true;
        forced.keep_stale = true;
        let forced = build_settings(&forced, &cfg);
        assert!(!forced.skip_existing);
        assert!(!forced.remove_stale);
    }
}
