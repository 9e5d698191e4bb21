//! The install pipeline.
//!
//! 1. Open the recipe package and reject recipes that are not installable.
//! 2. Find required archives already in the downloads directory (size first,
//!    then hash).
//! 3. Download the rest on a separate, smaller pool.
//! 4. Register every available archive with the VFS.
//! 5. Record each archive's download state in a `<archive>.meta` sidecar, so
//!    the downloads directory can serve as a compile pool later.
//! 6. Delete files the recipe does not produce and skip outputs that already
//!    exist with the expected hash.
//! 7. Replay the remaining directives in three waves: plain files (including
//!    staged container members), then merges, then containers.
//! 8. Remove the container staging directory.

use crate::download::{DownloadError, Downloader};
use crate::error::{Error, FailureKind, Result};
use crate::replay::{replay, ReplayContext};
use crate::settings::InstallerSettings;
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::{CancellationToken, Hash, RelativePath};
use mlk_patch::BinaryPatchCache;
use mlk_recipe::{ArchiveDescriptor, Directive, DirectiveKind, RecipePackage, RemapRoots, TEMP_BSA_DIR};
use mlk_vfs::{ContainerCodec, Context, ZipReader};
use parking_lot::Mutex;
use rayon::prelude::*;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Paths with a `[NoDelete]` component survive the stale-file sweep.
const NO_DELETE_PATTERN: &str = r"(?i)[\\/]\[NoDelete\]";

/// Progress information emitted during an install.
///
/// `current`/`total` count archives while downloading and directives while
/// installing.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgress {
    pub stage: InstallStage,
    pub current_file: Option<String>,
    pub current: u32,
    pub total: u32,
}

/// Emitted in order: `LoadingRecipe` -> `HashingDownloads` -> `Downloading`
/// -> `Preparing` -> `Installing` (repeated) -> `CleaningUp` -> `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InstallStage {
    LoadingRecipe,
    HashingDownloads,
    Downloading,
    Preparing,
    Installing,
    CleaningUp,
    Complete,
}

/// A directive that could not be replayed.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveFailure {
    pub to: RelativePath,
    pub kind: FailureKind,
    pub reason: String,
}

/// Summary returned by [`Installer::install`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    /// `true` if every installable directive was written or skipped.
    pub success: bool,
    /// Files written, staged container members excluded.
    pub written: usize,
    /// Files already present with the expected hash.
    pub skipped: usize,
    /// Files deleted from the install directory because no directive produces them.
    pub removed: Vec<RelativePath>,
    pub failures: Vec<DirectiveFailure>,
    /// Archives fetched through a downloader during this run.
    pub downloaded: Vec<String>,
    /// Directives of unknown types, left out with a warning.
    pub unsupported: Vec<RelativePath>,
    pub elapsed: Duration,
}

type ProgressCallback = Arc<dyn Fn(InstallProgress) + Send + Sync>;

/// Rebuilds an installed setup from a recipe package and the archive pool.
pub struct Installer {
    settings: InstallerSettings,
    vfs: Arc<Context>,
    patches: Arc<BinaryPatchCache>,
    downloaders: Vec<Arc<dyn Downloader>>,
    codecs: Vec<Arc<dyn ContainerCodec>>,
    progress_callback: Option<ProgressCallback>,
}

/// Removes the container staging directory when dropped.
struct StagingGuard(Utf8PathBuf);

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = std::fs::remove_dir_all(self.0.as_std_path()) {
                tracing::warn!("Could not remove {}: {}", self.0, e);
            }
        }
    }
}

impl Installer {
    /// Create an installer with the zip codec and no downloaders.
    pub fn new(settings: InstallerSettings, vfs: Arc<Context>, patches: Arc<BinaryPatchCache>) -> Self {
        Self {
            settings,
            vfs,
            patches,
            downloaders: Vec::new(),
            codecs: vec![Arc::new(ZipReader)],
            progress_callback: None,
        }
    }

    /// Register a downloader. Downloaders are tried in registration order.
    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloaders.push(downloader);
        self
    }

    /// Register a container codec for `CreateBSA` directives.
    pub fn with_codec(mut self, codec: Arc<dyn ContainerCodec>) -> Self {
        self.codecs.push(codec);
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(InstallProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn settings(&self) -> &InstallerSettings {
        &self.settings
    }

    /// Run the whole pipeline.
    ///
    /// Every directive is attempted; failures are collected in the report. Only
    /// setup problems and cancellation return an error.
    pub fn install(&self, token: &CancellationToken) -> Result<InstallReport> {
        let start = Instant::now();
        self.settings.validate()?;

        self.emit_progress(InstallStage::LoadingRecipe, None, 0, 0);
        let package = RecipePackage::open(&self.settings.package)?;
        let recipe = package.recipe();
        recipe.validate()?;
        tracing::info!(
            "Installing '{}' {} ({} directives, {} archives) into {}",
            recipe.name,
            recipe.version,
            recipe.directives.len(),
            recipe.archives.len(),
            self.settings.install_dir
        );

        let (directives, unsupported): (Vec<&Directive>, Vec<&Directive>) = recipe
            .directives
            .iter()
            .partition(|d| !matches!(d.kind, DirectiveKind::Unknown { .. }));
        for directive in &unsupported {
            tracing::warn!(
                "Skipping {}: unknown directive type '{}'",
                directive.to,
                directive.type_name()
            );
        }

        for dir in [&self.settings.install_dir, &self.settings.downloads_dir] {
            std::fs::create_dir_all(dir.as_std_path()).map_err(|source| Error::IoFault {
                path: dir.clone(),
                source,
            })?;
        }
        let pool = thread_pool("mlk-install", self.settings.workers)?;
        let download_pool = thread_pool("mlk-download", self.settings.download_threads())?;

        self.emit_progress(InstallStage::HashingDownloads, None, 0, 0);
        let mut present = pool.install(|| self.locate_archives(&recipe.archives, token))?;

        let (downloaded, missing) =
            download_pool.install(|| self.download_missing(&recipe.archives, &mut present, token))?;
        for (hash, path) in &present {
            self.vfs.register_archive(path, *hash)?;
        }
        self.write_meta_files(&recipe.archives, &present);

        self.emit_progress(InstallStage::Preparing, None, 0, 0);
        let removed = if self.settings.remove_stale {
            self.remove_stale_files(&recipe.directives)?
        } else {
            Vec::new()
        };
        let skipped = if self.settings.skip_existing {
            pool.install(|| self.existing_outputs(&directives, token))?
        } else {
            HashSet::new()
        };
        let waves = plan_waves(&directives, &skipped);

        let staging = StagingGuard(self.settings.install_dir.join(TEMP_BSA_DIR));
        let ctx = ReplayContext {
            settings: &self.settings,
            package: &package,
            vfs: &self.vfs,
            patches: &self.patches,
            codecs: &self.codecs,
            remap: RemapRoots::new(
                self.settings.game_dir.as_deref(),
                Some(self.settings.install_dir.as_path()),
                Some(self.settings.downloads_dir.as_path()),
            ),
            token,
        };

        let total = waves.iter().map(Vec::len).sum::<usize>() as u32;
        let done = AtomicU32::new(0);
        let written = AtomicUsize::new(0);
        let failures = Mutex::new(Vec::new());
        self.emit_progress(InstallStage::Installing, None, 0, total);

        for wave in &waves {
            pool.install(|| {
                wave.par_iter().try_for_each(|directive| -> Result<()> {
                    let outcome = match missing_archive(directive, recipe.archives.as_slice(), &missing) {
                        Some(e) => Err(e),
                        None => replay(directive, &ctx),
                    };
                    match outcome {
                        Ok(()) => {
                            if directive.to.top_level() != TEMP_BSA_DIR {
                                written.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => {
                            tracing::error!("Failed to install {}: {}", directive.to, e);
                            failures.lock().push(DirectiveFailure {
                                to: directive.to.clone(),
                                kind: e.kind(),
                                reason: e.to_string(),
                            });
                        }
                    }
                    let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                    self.emit_progress(InstallStage::Installing, Some(directive.to.to_string()), current, total);
                    Ok(())
                })
            })?;
        }

        self.emit_progress(InstallStage::CleaningUp, None, 0, 0);
        drop(staging);

        let mut failures = failures.into_inner();
        failures.sort_by(|a, b| a.to.cmp(&b.to));
        let report = InstallReport {
            success: failures.is_empty(),
            written: written.into_inner(),
            skipped: skipped.len(),
            removed,
            failures,
            downloaded,
            unsupported: unsupported.iter().map(|d| d.to.clone()).collect(),
            elapsed: start.elapsed(),
        };
        self.emit_progress(InstallStage::Complete, None, 0, 0);
        if report.success {
            tracing::info!(
                "Install finished in {:.2?}: {} written, {} already present",
                report.elapsed,
                report.written,
                report.skipped
            );
        } else {
            tracing::error!("Install finished with {} failed files", report.failures.len());
        }
        Ok(report)
    }

    /// Required archives already in the downloads directory, by hash.
    ///
    /// Only files whose size matches some required archive are hashed.
    fn locate_archives(
        &self,
        archives: &[ArchiveDescriptor],
        token: &CancellationToken,
    ) -> Result<HashMap<Hash, Utf8PathBuf>> {
        let sizes: HashSet<u64> = archives.iter().map(|a| a.size).collect();
        let wanted: HashSet<Hash> = archives.iter().map(|a| a.hash).collect();
        let dir = &self.settings.downloads_dir;

        let mut candidates = Vec::new();
        let read_dir = std::fs::read_dir(dir.as_std_path()).map_err(|source| Error::IoFault {
            path: dir.clone(),
            source,
        })?;
        for entry in read_dir {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() || !sizes.contains(&metadata.len()) {
                continue;
            }
            if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
                candidates.push(path);
            }
        }
        candidates.sort();

        let hashes = self.vfs.hash_cache();
        let hashed: Vec<(Utf8PathBuf, Hash)> = candidates
            .into_par_iter()
            .map(|path| {
                let hash = hashes.hash_file(&path, token)?;
                Ok((path, hash))
            })
            .collect::<Result<_>>()?;

        let mut found = HashMap::new();
        for (path, hash) in hashed {
            if wanted.contains(&hash) {
                found.entry(hash).or_insert(path);
            }
        }
        tracing::info!(
            "{} of {} archives already downloaded",
            found.len(),
            archives.len()
        );
        Ok(found)
    }

    /// Fetch every archive not in `present`. Returns the names downloaded and
    /// the reason each remaining archive is unavailable.
    fn download_missing(
        &self,
        archives: &[ArchiveDescriptor],
        present: &mut HashMap<Hash, Utf8PathBuf>,
        token: &CancellationToken,
    ) -> Result<(Vec<String>, HashMap<Hash, String>)> {
        let needed: Vec<&ArchiveDescriptor> = archives
            .iter()
            .filter(|a| !present.contains_key(&a.hash))
            .collect();
        if needed.is_empty() {
            return Ok((Vec::new(), HashMap::new()));
        }

        let total = needed.len() as u32;
        let done = AtomicU32::new(0);
        tracing::info!("Downloading {} archives", total);
        self.emit_progress(InstallStage::Downloading, None, 0, total);

        let results: Vec<(&ArchiveDescriptor, Result<Utf8PathBuf>)> = needed
            .par_iter()
            .map(|archive| {
                let result = self.download(archive, token);
                let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                self.emit_progress(InstallStage::Downloading, Some(archive.name.clone()), current, total);
                (*archive, result)
            })
            .collect();

        let mut downloaded = Vec::new();
        let mut missing = HashMap::new();
        for (archive, result) in results {
            match result {
                Ok(path) => {
                    downloaded.push(archive.name.clone());
                    present.insert(archive.hash, path);
                }
                Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::warn!("Archive {} is unavailable: {}", archive.name, e);
                    missing.insert(archive.hash, e.to_string());
                }
            }
        }
        downloaded.sort();
        Ok((downloaded, missing))
    }

    fn download(&self, archive: &ArchiveDescriptor, token: &CancellationToken) -> Result<Utf8PathBuf> {
        let downloader = self
            .downloaders
            .iter()
            .find(|d| d.can_download(archive))
            .ok_or_else(|| {
                DownloadError::Unsupported(archive.state_type().unwrap_or("untyped").to_string())
            })?;
        let file_name = Utf8Path::new(&archive.name)
            .file_name()
            .ok_or_else(|| DownloadError::Failed(format!("'{}' is not a file name", archive.name)))?;
        let dest = self.settings.downloads_dir.join(file_name);

        tracing::debug!("Fetching {} with {}", archive.name, downloader.name());
        let actual = downloader.fetch(archive, &dest, None, token)?;
        if actual != archive.hash {
            if let Err(e) = std::fs::remove_file(dest.as_std_path()) {
                tracing::warn!("Could not remove bad download {}: {}", dest, e);
            }
            return Err(Error::HashMismatch {
                expected: archive.hash,
                actual,
            });
        }
        self.vfs.hash_cache().write(&dest, actual)?;
        Ok(dest)
    }

    /// Write the download state of every archive at hand next to it.
    ///
    /// A sidecar that cannot be written only costs the ability to compile from
    /// this downloads directory, so failures are logged and skipped.
    fn write_meta_files(&self, archives: &[ArchiveDescriptor], present: &HashMap<Hash, Utf8PathBuf>) {
        for archive in archives {
            let Some(path) = present.get(&archive.hash) else {
                continue;
            };
            match archive.write_meta(path) {
                Ok(meta) => tracing::debug!("Wrote {}", meta),
                Err(e) => tracing::warn!("Could not record download state of {}: {}", archive.name, e),
            }
        }
    }

    /// Delete every file under the install directory that no directive
    /// produces, then prune the directories left empty.
    ///
    /// Kept: the downloads directory, the recipe package, save games in
    /// `profiles/<name>/saves/` and paths with a `[NoDelete]` component.
    fn remove_stale_files(&self, directives: &[Directive]) -> Result<Vec<RelativePath>> {
        let install_dir = &self.settings.install_dir;
        let no_delete = Regex::new(NO_DELETE_PATTERN).map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let expected: HashSet<&RelativePath> = directives.iter().map(|d| &d.to).collect();
        let downloads = self.settings.downloads_dir.as_std_path();

        let mut removed = Vec::new();
        let mut dirs = Vec::new();
        let walker = WalkDir::new(install_dir.as_std_path())
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.path() != downloads);
        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path().to_path_buf()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                dirs.push(path);
                continue;
            }
            if path == self.settings.package {
                continue;
            }
            let Ok(relative) = RelativePath::from_base(install_dir, &path) else {
                continue;
            };
            let spaceless: String = path.as_str().chars().filter(|c| !c.is_whitespace()).collect();
            if expected.contains(&relative) || is_save_game(&relative) || no_delete.is_match(&spaceless) {
                continue;
            }

            tracing::debug!("Removing {}, it is not part of this modlist", relative);
            std::fs::remove_file(path.as_std_path()).map_err(|source| Error::IoFault {
                path: path.clone(),
                source,
            })?;
            removed.push(relative);
        }

        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        for dir in dirs {
            if let Err(e) = std::fs::remove_dir(dir.as_std_path()) {
                tracing::trace!("Keeping directory {}: {}", dir, e);
            }
        }

        removed.sort();
        if !removed.is_empty() {
            tracing::info!("Removed {} files that are not part of this modlist", removed.len());
        }
        Ok(removed)
    }

    /// Destinations that already hold the expected bytes.
    fn existing_outputs(&self, directives: &[&Directive], token: &CancellationToken) -> Result<HashSet<RelativePath>> {
        let hashes = self.vfs.hash_cache();
        let install_dir = &self.settings.install_dir;
        let found: Vec<Option<RelativePath>> = directives
            .par_iter()
            .filter(|d| d.is_deterministic() && d.to.top_level() != TEMP_BSA_DIR)
            .map(|d| {
                let path = d.to.to_path(install_dir);
                match std::fs::metadata(path.as_std_path()) {
                    Ok(m) if m.is_file() && m.len() == d.size => {}
                    _ => return Ok(None),
                }
                let hash = hashes.hash_file(&path, token)?;
                Ok((hash == d.hash).then(|| d.to.clone()))
            })
            .collect::<Result<_>>()?;
        let found: HashSet<RelativePath> = found.into_iter().flatten().collect();
        if !found.is_empty() {
            tracing::info!("{} files are already in place", found.len());
        }
        Ok(found)
    }

    fn emit_progress(&self, stage: InstallStage, current_file: Option<String>, current: u32, total: u32) {
        if let Some(callback) = &self.progress_callback {
            callback(InstallProgress {
                stage,
                current_file,
                current,
                total,
            });
        }
    }
}

fn thread_pool(name: &'static str, workers: usize) -> Result<rayon::ThreadPool> {
    let mut builder = rayon::ThreadPoolBuilder::new().thread_name(move |i| format!("{}-{}", name, i));
    if workers > 0 {
        builder = builder.num_threads(workers);
    }
    builder
        .build()
        .map_err(|e| Error::Io(std::io::Error::other(e)))
}

/// `profiles/<name>/saves/...`: save games are never swept.
fn is_save_game(path: &RelativePath) -> bool {
    let segments: Vec<&str> = path.segments().collect();
    segments.len() >= 3
        && segments[0].eq_ignore_ascii_case("profiles")
        && segments[segments.len() - 2].eq_ignore_ascii_case("saves")
}

/// Split directives into replay waves, leaving out skipped outputs and the
/// members of containers that are skipped.
fn plan_waves<'d>(directives: &[&'d Directive], skipped: &HashSet<RelativePath>) -> [Vec<&'d Directive>; 3] {
    let active_containers: HashSet<&str> = directives
        .iter()
        .filter(|d| !skipped.contains(&d.to))
        .filter_map(|d| match &d.kind {
            DirectiveKind::CreateBsa { temp_id, .. } => Some(temp_id.as_str()),
            _ => None,
        })
        .collect();

    let mut waves: [Vec<&Directive>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for directive in directives.iter().copied() {
        if skipped.contains(&directive.to) {
            continue;
        }
        if directive.to.top_level() == TEMP_BSA_DIR {
            let temp_id = directive.to.segments().nth(1).unwrap_or_default();
            if !active_containers.contains(temp_id) {
                continue;
            }
        }
        let wave = match directive.kind {
            DirectiveKind::MergedPatch { .. } => 1,
            DirectiveKind::CreateBsa { .. } => 2,
            _ => 0,
        };
        waves[wave].push(directive);
    }
    waves
}

/// The failure for a directive whose source archive could not be obtained.
fn missing_archive(
    directive: &Directive,
    archives: &[ArchiveDescriptor],
    missing: &HashMap<Hash, String>,
) -> Option<Error> {
    let hash = directive.archive_hash_path()?.hash;
    let reason = missing.get(&hash)?;
    let name = archives
        .iter()
        .find(|a| a.hash == hash)
        .map(|a| a.name.clone())
        .unwrap_or_default();
    Some(Error::MissingArchive {
        name,
        hash,
        reason: reason.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(to: &str, kind: DirectiveKind) -> Directive {
        Directive::new(RelativePath::new(to).unwrap(), Hash(1), 1, kind)
    }

    fn from_archive(to: &str) -> Directive {
        directive(
            to,
            DirectiveKind::FromArchive {
                archive_hash_path: mlk_core::HashPath::new(Hash(9)),
            },
        )
    }

    fn container(to: &str, temp_id: &str) -> Directive {
        directive(
            to,
            DirectiveKind::CreateBsa {
                temp_id: temp_id.to_string(),
                state: mlk_vfs::ContainerState {
                    format: "zip".to_string(),
                    options: serde_json::Value::Null,
                },
                file_states: Vec::new(),
            },
        )
    }

    #[test]
    fn test_waves_respect_dependencies() {
        let all = vec![
            container("Data/a.zip", "aaaa"),
            directive(
                "Data/merged.esp",
                DirectiveKind::MergedPatch {
                    sources: Vec::new(),
                    patch_id: "p".to_string(),
                },
            ),
            from_archive("TEMP_BSA_FILES/aaaa/x.nif"),
            from_archive("Data/plain.esp"),
        ];
        let refs: Vec<&Directive> = all.iter().collect();
        let waves = plan_waves(&refs, &HashSet::new());

        let names = |w: &Vec<&Directive>| w.iter().map(|d| d.to.to_string()).collect::<Vec<_>>();
        assert_eq!(names(&waves[0]), vec!["TEMP_BSA_FILES/aaaa/x.nif", "Data/plain.esp"]);
        assert_eq!(names(&waves[1]), vec!["Data/merged.esp"]);
        assert_eq!(names(&waves[2]), vec!["Data/a.zip"]);
    }

    #[test]
    fn test_skipped_container_drops_its_members() {
        let all = vec![
            container("Data/a.zip", "aaaa"),
            container("Data/b.zip", "bbbb"),
            from_archive("TEMP_BSA_FILES/aaaa/x.nif"),
            from_archive("TEMP_BSA_FILES/bbbb/y.nif"),
        ];
        let refs: Vec<&Directive> = all.iter().collect();
        let skipped: HashSet<RelativePath> = [RelativePath::new("Data/a.zip").unwrap()].into();
        let waves = plan_waves(&refs, &skipped);

        assert_eq!(waves[0].len(), 1);
        assert_eq!(waves[0][0].to.as_str(), "TEMP_BSA_FILES/bbbb/y.nif");
        assert_eq!(waves[2].len(), 1);
    }

    #[test]
    fn test_missing_archive_error() {
        let d = from_archive("Data/plain.esp");
        let archives = vec![ArchiveDescriptor {
            name: "Plain.zip".to_string(),
            hash: Hash(9),
            size: 1,
            state: serde_json::Value::Null,
            meta: None,
        }];
        let missing: HashMap<Hash, String> = [(Hash(9), "not found".to_string())].into();

        let err = missing_archive(&d, &archives, &missing).unwrap();
        assert_eq!(err.kind(), FailureKind::MissingArchive);
        assert!(err.to_string().contains("Plain.zip"));
        assert!(missing_archive(&d, &archives, &HashMap::new()).is_none());
    }
}
