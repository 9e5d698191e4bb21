//! Application configuration stored in modlist-kit.toml.

use crate::errors::CliError;
use camino::{Utf8Path, Utf8PathBuf};
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

pub const CONFIG_FILE_NAME: &str = "modlist-kit.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Hash, VFS and patch caches. Defaults to the platform cache directory.
    pub cache_dir: Option<Utf8PathBuf>,
    /// Worker threads for hashing, matching and replay; `0` uses one per CPU.
    pub workers: usize,
    /// Concurrent downloads during install; `0` means 4.
    pub download_workers: usize,
    pub max_inline_size: Option<u64>,
    pub max_archive_depth: Option<usize>,
    /// Directories the installer copies missing archives from.
    pub mirrors: Vec<Utf8PathBuf>,
}

impl AppConfig {
    /// The configured cache directory, or the platform default.
    pub fn cache_dir(&self) -> Result<Utf8PathBuf, CliError> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let dirs = ProjectDirs::from("", "", "modlist-kit").ok_or(CliError::NoCacheDir)?;
        Utf8PathBuf::from_path_buf(dirs.cache_dir().to_path_buf()).map_err(|_| CliError::NoCacheDir)
    }
}

/// Returns the directory where the current executable resides.
pub fn install_dir() -> Option<Utf8PathBuf> {
    let exe = env::current_exe().ok()?;
    let parent = exe.parent()?;
    Utf8PathBuf::from_path_buf(parent.to_path_buf()).ok()
}

/// Returns the default configuration file path, next to the executable.
pub fn default_config_path() -> Option<Utf8PathBuf> {
    install_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Load the configuration.
///
/// An explicit path must exist. Without one, the file next to the executable is
/// used if present, otherwise defaults.
pub fn load_config(explicit: Option<&Utf8Path>) -> Result<AppConfig, CliError> {
    let path = match explicit {
        Some(path) if !path.is_file() => {
            return Err(CliError::ConfigNotFound {
                path: path.to_path_buf(),
            })
        }
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.is_file() => path,
            _ => return Ok(AppConfig::default()),
        },
    };
    read_config(&path)
}

pub fn read_config(path: &Utf8Path) -> Result<AppConfig, CliError> {
    let content = fs::read_to_string(path.as_std_path())?;
    tracing::debug!("Loaded configuration from {}", path);
    toml::from_str(&content).map_err(|e| CliError::config_parse_error(path.to_path_buf(), e))
}
