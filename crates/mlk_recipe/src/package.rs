//! The distributable recipe package.
//!
//! A package is a zip file holding:
//!
//! - `modlist`: the [`Recipe`] as JSON
//! - `modlist.meta.json`: [`DownloadMetadata`] for galleries and download pages
//! - one entry per data id (inlined files and patch deltas), named by the id

use crate::error::{Error, Result};
use crate::recipe::Recipe;
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::fs::stage_in;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const RECIPE_ENTRY: &str = "modlist";
pub const METADATA_ENTRY: &str = "modlist.meta.json";

/// Conventional file extension of a recipe package.
pub const PACKAGE_EXTENSION: &str = "mlk";

/// Summary published next to a package so it can be listed without opening it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMetadata {
    pub title: String,
    pub author: String,
    pub description: String,
    pub version: String,
    pub game: String,
    pub download_size: u64,
    pub install_size: u64,
    pub archive_count: u64,
    pub directive_count: u64,
}

impl DownloadMetadata {
    pub fn from_recipe(recipe: &Recipe) -> Self {
        Self {
            title: recipe.name.clone(),
            author: recipe.author.clone(),
            description: recipe.description.clone(),
            version: recipe.version.clone(),
            game: recipe.game.clone(),
            download_size: recipe.archive_size,
            install_size: recipe.install_size,
            archive_count: recipe.archive_count,
            directive_count: recipe.directives.len() as u64,
        }
    }
}

/// Collects a recipe and its data entries and writes them as one package.
#[derive(Debug)]
pub struct PackageBuilder {
    recipe: Recipe,
    data: BTreeMap<String, Vec<u8>>,
}

impl PackageBuilder {
    pub fn new(recipe: Recipe) -> Self {
        Self {
            recipe,
            data: BTreeMap::new(),
        }
    }

    pub fn add_data(&mut self, id: impl Into<String>, bytes: Vec<u8>) -> &mut Self {
        self.data.insert(id.into(), bytes);
        self
    }

    pub fn has_data(&self, id: &str) -> bool {
        self.data.contains_key(id)
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn recipe_mut(&mut self) -> &mut Recipe {
        &mut self.recipe
    }

    /// Write the package to `path`, replacing any existing file.
    ///
    /// Fails if a directive refers to a data id that was never added.
    pub fn write(mut self, path: &Utf8Path) -> Result<Recipe> {
        self.recipe.update_metadata();
        if let Some(missing) = self
            .recipe
            .directives
            .iter()
            .flat_map(|d| d.data_ids())
            .find(|id| !self.data.contains_key(*id))
        {
            return Err(Error::InvalidRecipe(format!("data entry '{}' was never added", missing)));
        }

        let staged = stage_in(path)?;
        let mut zip = ZipWriter::new(staged.reopen()?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file(RECIPE_ENTRY, options)?;
        zip.write_all(&self.recipe.to_json()?)?;

        zip.start_file(METADATA_ENTRY, options)?;
        zip.write_all(&serde_json::to_vec_pretty(&DownloadMetadata::from_recipe(
            &self.recipe,
        ))?)?;

        for (id, bytes) in &self.data {
            zip.start_file(id.as_str(), options)?;
            zip.write_all(bytes)?;
        }
        zip.finish()?;

        staged
            .persist(path.as_std_path())
            .map_err(|e| Error::Io(e.error))?;
        tracing::info!(
            "Wrote recipe package {} ({} directives, {} data entries)",
            path,
            self.recipe.directives.len(),
            self.data.len()
        );
        Ok(self.recipe)
    }
}

/// A recipe package opened for installation.
#[derive(Debug)]
pub struct RecipePackage {
    path: Utf8PathBuf,
    recipe: Recipe,
    metadata: Option<DownloadMetadata>,
}

impl RecipePackage {
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut archive = open_zip(&path)?;

        let recipe = Recipe::from_json(&read_entry(&mut archive, RECIPE_ENTRY)?)?;
        let metadata = match read_entry(&mut archive, METADATA_ENTRY) {
            Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
            Err(Error::MissingEntry(_)) => None,
            Err(e) => return Err(e),
        };

        tracing::debug!(
            "Opened recipe package {}: '{}' with {} directives",
            path,
            recipe.name,
            recipe.directives.len()
        );
        Ok(Self {
            path,
            recipe,
            metadata,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn metadata(&self) -> Option<&DownloadMetadata> {
        self.metadata.as_ref()
    }

    /// Bytes of one data entry. Opens the package afresh, so calls may run concurrently.
    pub fn data(&self, id: &str) -> Result<Vec<u8>> {
        let mut archive = open_zip(&self.path)?;
        read_entry(&mut archive, id)
    }

    /// Names of every data entry in the package.
    pub fn data_ids(&self) -> Result<Vec<String>> {
        let archive = open_zip(&self.path)?;
        Ok(archive
            .file_names()
            .filter(|name| *name != RECIPE_ENTRY && *name != METADATA_ENTRY)
            .map(str::to_string)
            .collect())
    }
}

fn open_zip(path: &Utf8Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(path.as_std_path())?;
    Ok(ZipArchive::new(BufReader::new(file))?)
}

fn read_entry<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Err(Error::MissingEntry(name.to_string())),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}
