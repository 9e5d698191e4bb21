use crate::utils::config::{self, AppConfig};
use camino::Utf8Path;
use colored::Colorize;
use miette::Result;

/// Print a config path entry with status indicator
fn print_path_config(name: &str, path: Option<&Utf8Path>) {
    match path {
        Some(p) => {
            let status = if p.exists() {
                "✓".bright_green()
            } else {
                "✗".bright_red()
            };
            println!("  {} {} {}", format!("{}:", name).bright_white(), p, status);
        }
        None => {
            println!(
                "  {} {}",
                format!("{}:", name).bright_white(),
                "(not set)".bright_yellow()
            );
        }
    }
}

fn print_value(name: &str, value: impl std::fmt::Display) {
    println!("  {} {}", format!("{}:", name).bright_white(), value);
}

pub fn show_config(cfg: &AppConfig, explicit: Option<&Utf8Path>) -> Result<()> {
    let config_path = explicit
        .map(|p| p.to_string())
        .or_else(|| config::default_config_path().map(|p| p.to_string()))
        .unwrap_or_else(|| "Unknown".to_string());

    println!();
    println!("  {} {}", "config_file:".bright_white(), config_path);

    let cache_dir = cfg.cache_dir()?;
    print_path_config("cache_dir", Some(cache_dir.as_path()));
    print_value("workers", cfg.workers);
    print_value("download_workers", cfg.download_workers);
    match cfg.max_inline_size {
        Some(size) => print_value("max_inline_size", size),
        None => print_path_config("max_inline_size", None),
    }
    match cfg.max_archive_depth {
        Some(depth) => print_value("max_archive_depth", depth),
        None => print_path_config("max_archive_depth", None),
    }
    if cfg.mirrors.is_empty() {
        print_path_config("mirrors", None);
    }
    for mirror in &cfg.mirrors {
        print_path_config("mirrors", Some(mirror.as_path()));
    }

    println!();
    Ok(())
}
