use crate::error::{Error, Result};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Everything an install needs to know.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallerSettings {
    /// The recipe package to replay.
    pub package: Utf8PathBuf,
    /// Where the setup is rebuilt.
    pub install_dir: Utf8PathBuf,
    /// Archives are looked for and downloaded here.
    pub downloads_dir: Utf8PathBuf,
    /// Game installation, substituted into path-remapped configs.
    pub game_dir: Option<Utf8PathBuf>,
    /// Replay threads; `0` uses one per CPU.
    pub workers: usize,
    /// Concurrent downloads; `0` means 4.
    pub download_workers: usize,
    /// Reuse outputs that already exist with the expected hash.
    pub skip_existing: bool,
    /// Delete files in the install directory that the recipe does not produce.
    pub remove_stale: bool,
}

impl InstallerSettings {
    pub fn new(
        package: impl Into<Utf8PathBuf>,
        install_dir: impl Into<Utf8PathBuf>,
        downloads_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            package: package.into(),
            install_dir: install_dir.into(),
            downloads_dir: downloads_dir.into(),
            skip_existing: true,
            remove_stale: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.package.is_file() {
            return Err(Error::InvalidSettings(format!(
                "recipe package {} does not exist",
                self.package
            )));
        }
        if self.install_dir.as_str().is_empty() {
            return Err(Error::InvalidSettings("no install directory".to_string()));
        }
        if self.downloads_dir.as_str().is_empty() {
            return Err(Error::InvalidSettings("no downloads directory".to_string()));
        }
        if self.install_dir.starts_with(&self.downloads_dir) {
            return Err(Error::InvalidSettings(format!(
                "install directory {} must not be inside the downloads directory",
                self.install_dir
            )));
        }
        Ok(())
    }

    pub(crate) fn download_threads(&self) -> usize {
        if self.download_workers == 0 {
            4
        } else {
            self.download_workers
        }
    }
}
