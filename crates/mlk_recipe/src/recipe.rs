use crate::archive::ArchiveDescriptor;
use crate::directive::Directive;
use crate::error::{Error, Result};
use itertools::Itertools;
use mlk_core::Hash;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Current recipe document version.
pub const FORMAT_VERSION: u32 = 1;

/// Staging directory for container members, relative to the install directory.
pub const TEMP_BSA_DIR: &str = "TEMP_BSA_FILES";

/// Everything needed to rebuild an installation from an archive pool.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub format_version: u32,
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    pub game: String,

    /// Total bytes of every installed file.
    #[serde(default)]
    pub install_size: u64,
    #[serde(default)]
    pub archive_count: u64,
    /// Total bytes of every required archive.
    #[serde(default)]
    pub archive_size: u64,

    pub archives: Vec<ArchiveDescriptor>,
    pub directives: Vec<Directive>,
}

impl Recipe {
    pub fn new(name: impl Into<String>, game: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            name: name.into(),
            game: game.into(),
            ..Self::default()
        }
    }

    /// Recompute the derived size and count fields.
    pub fn update_metadata(&mut self) {
        self.install_size = self
            .directives
            .iter()
            .filter(|d| d.to.top_level() != TEMP_BSA_DIR)
            .map(|d| d.size)
            .sum();
        self.archive_count = self.archives.len() as u64;
        self.archive_size = self.archives.iter().map(|a| a.size).sum();
    }

    pub fn archive(&self, hash: Hash) -> Option<&ArchiveDescriptor> {
        self.archives.iter().find(|a| a.hash == hash)
    }

    /// Check the recipe can be installed as-is.
    ///
    /// Rejects terminal directives, references to archives not listed in
    /// [`archives`](Self::archives), and duplicate destinations.
    pub fn validate(&self) -> Result<()> {
        if self.format_version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                found: self.format_version,
                supported: FORMAT_VERSION,
            });
        }

        let terminal: Vec<&Directive> = self.directives.iter().filter(|d| d.is_terminal()).collect();
        if !terminal.is_empty() {
            return Err(Error::InvalidRecipe(format!(
                "{} unresolved directives, e.g. {}",
                terminal.len(),
                terminal.iter().take(3).map(|d| d.to.as_str()).join(", ")
            )));
        }

        let known: HashSet<Hash> = self.archives.iter().map(|a| a.hash).collect();
        if let Some(orphan) = self
            .directives
            .iter()
            .find(|d| d.archive_hash_path().is_some_and(|p| !known.contains(&p.hash)))
        {
            return Err(Error::InvalidRecipe(format!(
                "'{}' refers to an archive that is not listed",
                orphan.to
            )));
        }

        if let Some(dup) = self.directives.iter().map(|d| &d.to).duplicates().next() {
            return Err(Error::InvalidRecipe(format!("'{}' is produced twice", dup)));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
