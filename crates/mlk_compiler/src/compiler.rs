//! The compile pipeline.
//!
//! 1. Load the archive pool: every file directly in the downloads directory that
//!    has a `<archive>.meta` sidecar holding its download state.
//! 2. Index the pool through the VFS.
//! 3. Hash every installed file under the source directory.
//! 4. Run the step stack for each file in parallel; the first step to answer wins.
//! 5. Check merges, gather the archives the directives use, and write the package
//!    if nothing was left unmatched.

use crate::candidates::{NameSimilarityStrategy, PatchCandidateStrategy};
use crate::error::{Error, Result};
use crate::settings::{CompiledIgnore, CompilerSettings};
use crate::step::{index_images, CompilationStep, CompileContext, ContainerSupport, Resolution, SourceFile};
use crate::steps::default_stack;
use camino::Utf8PathBuf;
use mlk_core::{CancellationToken, Hash, RelativePath};
use mlk_patch::BinaryPatchCache;
use mlk_recipe::{meta_path, ArchiveDescriptor, Directive, DirectiveKind, PackageBuilder, Recipe, RemapRoots};
use mlk_vfs::{ByteSource, Context, IndexRoot, ZipReader};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use mlk_recipe::META_EXTENSION;

/// Progress information emitted during a compile.
///
/// `current`/`total` count files during [`Matching`](CompileStage::Matching).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileProgress {
    pub stage: CompileStage,
    /// Installed file just decided (set during `Matching`).
    pub current_file: Option<String>,
    pub current: u32,
    pub total: u32,
}

/// Emitted in order: `IndexingArchives` -> `HashingFiles` -> `Matching` (repeated)
/// -> `WritingRecipe` -> `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompileStage {
    IndexingArchives,
    HashingFiles,
    Matching,
    WritingRecipe,
    Complete,
}

/// An installed file no step could source.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedFile {
    pub path: RelativePath,
    pub reason: String,
}

/// An installed file left out on purpose.
#[derive(Debug, Clone, PartialEq)]
pub struct IgnoredFile {
    pub path: RelativePath,
    pub reason: String,
}

/// A downloads-directory file that did not make it into the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolRejection {
    pub path: Utf8PathBuf,
    pub reason: String,
}

/// Summary returned by [`Compiler::compile`].
#[derive(Debug)]
pub struct CompileReport {
    /// `true` if every installed file was sourced and the package was written.
    pub success: bool,
    pub recipe_path: Option<Utf8PathBuf>,
    /// Directives in the recipe, staged container members included.
    pub directive_count: usize,
    /// Directive count per `$type`, unmatched and ignored files included.
    pub by_type: BTreeMap<String, usize>,
    pub no_matches: Vec<UnresolvedFile>,
    pub ignored: Vec<IgnoredFile>,
    /// Archives the recipe depends on.
    pub archives: Vec<ArchiveDescriptor>,
    pub pool_failures: Vec<PoolRejection>,
    pub elapsed: Duration,
}

type ProgressCallback = Arc<dyn Fn(CompileProgress) + Send + Sync>;

/// Turns an installed setup plus an archive pool into a recipe package.
///
/// Create one with [`new`](Self::new), optionally register container formats,
/// a candidate strategy or a custom step stack, then call
/// [`compile`](Self::compile).
pub struct Compiler {
    settings: CompilerSettings,
    vfs: Arc<Context>,
    patches: Arc<BinaryPatchCache>,
    containers: Vec<ContainerSupport>,
    candidates: Arc<dyn PatchCandidateStrategy>,
    steps: Option<Vec<Arc<dyn CompilationStep>>>,
    progress_callback: Option<ProgressCallback>,
}

impl Compiler {
    /// Create a compiler with zip deconstruction and the default candidate
    /// strategy.
    pub fn new(settings: CompilerSettings, vfs: Arc<Context>, patches: Arc<BinaryPatchCache>) -> Self {
        Self {
            settings,
            vfs,
            patches,
            containers: vec![ContainerSupport {
                reader: Arc::new(ZipReader),
                codec: Arc::new(ZipReader),
            }],
            candidates: Arc::new(NameSimilarityStrategy::default()),
            steps: None,
            progress_callback: None,
        }
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(CompileProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Register another container format for deconstruction.
    pub fn with_container(mut self, support: ContainerSupport) -> Self {
        self.containers.push(support);
        self
    }

    pub fn with_candidate_strategy(mut self, strategy: Arc<dyn PatchCandidateStrategy>) -> Self {
        self.candidates = strategy;
        self
    }

    /// Replace the default stack. The last step should always answer.
    pub fn with_steps(mut self, steps: Vec<Arc<dyn CompilationStep>>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn settings(&self) -> &CompilerSettings {
        &self.settings
    }

    /// Run the whole pipeline.
    ///
    /// Unmatched files do not abort the run; they are all listed in the report
    /// and no package is written. Only setup failures and cancellation are errors.
    pub fn compile(&self, token: &CancellationToken) -> Result<CompileReport> {
        let start = Instant::now();
        self.settings.validate()?;
        let ignore = CompiledIgnore::new(&self.settings.ignore)?;
        let steps = match &self.steps {
            Some(steps) => steps.clone(),
            None => default_stack(&self.settings)?,
        };
        let pool = self.thread_pool()?;

        tracing::info!("Compiling '{}' from {}", self.settings.name, self.settings.source_dir);
        self.emit_progress(CompileStage::IndexingArchives, None, 0, 0);

        let (archives, mut pool_failures) = self.load_pool()?;
        let paths: Vec<Utf8PathBuf> = archives.keys().cloned().collect();
        let indexed = self.vfs.add_roots(&paths, token)?;
        pool_failures.extend(indexed.failures.into_iter().map(|f| PoolRejection {
            path: f.path,
            reason: f.error.to_string(),
        }));
        let index = self.vfs.index_root();

        self.emit_progress(CompileStage::HashingFiles, None, 0, 0);
        let files = pool.install(|| self.collect_sources(token))?;
        tracing::info!(
            "Matching {} installed files against {} archives",
            files.len(),
            index.roots().len()
        );

        let ctx = CompileContext {
            settings: &self.settings,
            vfs: &self.vfs,
            index: index.clone(),
            patches: &self.patches,
            containers: &self.containers,
            image_analyzer: self.vfs.image_analyzer(),
            candidates: self.candidates.as_ref(),
            remap: RemapRoots::new(
                self.settings.game_dir.as_deref(),
                Some(self.settings.source_dir.as_path()),
                Some(self.settings.downloads_dir.as_path()),
            ),
            token,
            ignore,
            files: files.iter().map(|f| (f.path.clone(), f.clone())).collect(),
            images_by_stem: index_images(&index),
        };

        let total = files.len() as u32;
        let done = AtomicU32::new(0);
        self.emit_progress(CompileStage::Matching, None, 0, total);
        let resolutions: Vec<Resolution> = pool.install(|| {
            files
                .par_iter()
                .map(|file| {
                    let resolution = resolve(file, &steps, &ctx)?;
                    let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                    self.emit_progress(CompileStage::Matching, Some(file.path.to_string()), current, total);
                    Ok(resolution)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        token.check()?;

        let mut directives = Vec::with_capacity(resolutions.len());
        let mut data = BTreeMap::new();
        for resolution in resolutions {
            directives.extend(resolution.staged);
            directives.push(resolution.directive);
            data.extend(resolution.data);
        }
        check_merge_sources(&mut directives);

        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        for directive in &directives {
            *by_type.entry(directive.type_name().to_string()).or_default() += 1;
        }

        let mut no_matches = Vec::new();
        let mut ignored = Vec::new();
        let mut recipe_directives = Vec::with_capacity(directives.len());
        for directive in directives {
            match directive.kind {
                DirectiveKind::NoMatch { reason } => {
                    tracing::warn!("No match for {}: {}", directive.to, reason);
                    no_matches.push(UnresolvedFile {
                        path: directive.to,
                        reason,
                    });
                }
                DirectiveKind::IgnoredDirectly { reason } => {
                    tracing::debug!("Ignoring {}: {}", directive.to, reason);
                    ignored.push(IgnoredFile {
                        path: directive.to,
                        reason,
                    });
                }
                _ => recipe_directives.push(directive),
            }
        }
        if !ignored.is_empty() {
            tracing::info!("Ignored {} installed files", ignored.len());
        }

        let required = required_archives(&recipe_directives, &index, &archives);
        let mut report = CompileReport {
            success: false,
            recipe_path: None,
            directive_count: recipe_directives.len(),
            by_type,
            no_matches,
            ignored,
            archives: required.clone(),
            pool_failures,
            elapsed: Duration::ZERO,
        };

        if report.no_matches.is_empty() {
            self.emit_progress(CompileStage::WritingRecipe, None, 0, 0);
            let mut recipe = Recipe::new(self.settings.name.clone(), self.settings.game.clone());
            recipe.author = self.settings.author.clone();
            recipe.description = self.settings.description.clone();
            recipe.version = self.settings.version.clone();
            recipe.archives = required;
            recipe.directives = recipe_directives;

            let used: HashSet<String> = recipe
                .directives
                .iter()
                .flat_map(|d| d.data_ids())
                .map(str::to_string)
                .collect();
            let mut builder = PackageBuilder::new(recipe);
            for (id, bytes) in data.into_iter().filter(|(id, _)| used.contains(id)) {
                builder.add_data(id, bytes);
            }
            builder.write(&self.settings.output)?;

            report.success = true;
            report.recipe_path = Some(self.settings.output.clone());
        } else {
            tracing::warn!(
                "{} installed files could not be sourced; no recipe written",
                report.no_matches.len()
            );
        }

        report.elapsed = start.elapsed();
        self.emit_progress(CompileStage::Complete, None, 0, 0);
        tracing::info!(
            "Compile finished in {:.2?}: {} directives, {} unmatched",
            report.elapsed,
            report.directive_count,
            report.no_matches.len()
        );
        Ok(report)
    }

    /// Archives with a readable `.meta` sidecar, keyed by path, plus rejections.
    fn load_pool(&self) -> Result<(HashMap<Utf8PathBuf, serde_json::Value>, Vec<PoolRejection>)> {
        let dir = &self.settings.downloads_dir;
        let mut archives = HashMap::new();
        let mut rejected = Vec::new();

        let read_dir = std::fs::read_dir(dir.as_std_path()).map_err(|source| Error::IoFault {
            path: dir.clone(),
            source,
        })?;
        for entry in read_dir {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                tracing::warn!("Skipping non UTF-8 download {}", entry.path().display());
                continue;
            };
            if path.extension().is_some_and(|e| e.eq_ignore_ascii_case(META_EXTENSION)) {
                continue;
            }

            let meta = meta_path(&path);
            let reason = match std::fs::read(meta.as_std_path()) {
                Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                    Ok(state) if state.is_object() => {
                        archives.insert(path, state);
                        continue;
                    }
                    Ok(_) => format!("{} does not hold a JSON object", meta),
                    Err(e) => format!("{} is not valid JSON: {}", meta, e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    format!("no {} sidecar describing where to download it", meta)
                }
                Err(e) => format!("cannot read {}: {}", meta, e),
            };
            tracing::warn!("Leaving {} out of the archive pool: {}", path, reason);
            rejected.push(PoolRejection { path, reason });
        }

        tracing::info!(
            "Archive pool: {} archives, {} rejected",
            archives.len(),
            rejected.len()
        );
        Ok((archives, rejected))
    }

    /// Hash every installed file, sorted by path.
    fn collect_sources(&self, token: &CancellationToken) -> Result<Vec<SourceFile>> {
        let source_dir = &self.settings.source_dir;
        let mut paths = Vec::new();
        for entry in walkdir::WalkDir::new(source_dir.as_std_path()).follow_links(false) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.into_path()) else {
                return Err(Error::InvalidSettings(format!(
                    "{} contains a file whose path is not UTF-8",
                    source_dir
                )));
            };
            if path == self.settings.output || path.starts_with(&self.settings.downloads_dir) {
                continue;
            }
            paths.push(path);
        }

        let hashes = self.vfs.hash_cache();
        let mut files: Vec<SourceFile> = paths
            .par_iter()
            .map(|path| {
                let relative = RelativePath::from_base(source_dir, path)?;
                let size = std::fs::metadata(path.as_std_path())
                    .map_err(|source| Error::IoFault {
                        path: path.clone(),
                        source,
                    })?
                    .len();
                let hash = hashes.hash_file(path, token)?;
                Ok(SourceFile {
                    path: relative,
                    hash,
                    size,
                    bytes: ByteSource::file(path.clone()),
                })
            })
            .collect::<Result<_>>()?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("mlk-compile-{}", i));
        if self.settings.workers > 0 {
            builder = builder.num_threads(self.settings.workers);
        }
        builder
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }

    fn emit_progress(&self, stage: CompileStage, current_file: Option<String>, current: u32, total: u32) {
        if let Some(callback) = &self.progress_callback {
            callback(CompileProgress {
                stage,
                current_file,
                current,
                total,
            });
        }
    }
}

/// Run `steps` on one file. A failing step turns the file into a `NoMatch`;
/// cancellation aborts.
fn resolve(file: &SourceFile, steps: &[Arc<dyn CompilationStep>], ctx: &CompileContext<'_>) -> Result<Resolution> {
    ctx.token.check()?;
    for step in steps {
        match step.run(file, ctx) {
            Ok(Some(resolution)) => {
                tracing::trace!("{} -> {} ({})", file.path, resolution.directive.type_name(), step.name());
                return Ok(resolution);
            }
            Ok(None) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::warn!("{} failed on {}: {}", step.name(), file.path, e);
                return Ok(Resolution::new(file.directive(DirectiveKind::NoMatch {
                    reason: format!("{} failed: {}", step.name(), e),
                })));
            }
        }
    }
    Ok(Resolution::new(file.directive(DirectiveKind::NoMatch {
        reason: "no step matched".to_string(),
    })))
}

/// Demote merges whose sources are not all produced by the recipe.
fn check_merge_sources(directives: &mut [Directive]) {
    let produced: HashSet<RelativePath> = directives
        .iter()
        .filter(|d| !d.is_terminal())
        .map(|d| d.to.clone())
        .collect();
    for directive in directives.iter_mut() {
        let missing = match &directive.kind {
            DirectiveKind::MergedPatch { sources, .. } => sources
                .iter()
                .find(|s| !produced.contains(&s.relative_path))
                .map(|s| s.relative_path.clone()),
            _ => None,
        };
        if let Some(missing) = missing {
            directive.kind = DirectiveKind::NoMatch {
                reason: format!("merge source {} is not produced by the recipe", missing),
            };
        }
    }
}

/// Distinct root archives referenced by `directives`, sorted by name.
fn required_archives(
    directives: &[Directive],
    index: &IndexRoot,
    states: &HashMap<Utf8PathBuf, serde_json::Value>,
) -> Vec<ArchiveDescriptor> {
    let hashes: HashSet<Hash> = directives
        .iter()
        .filter_map(|d| d.archive_hash_path().map(|p| p.hash))
        .collect();
    let mut archives: Vec<ArchiveDescriptor> = hashes
        .into_iter()
        .filter_map(|hash| {
            let root = index.root(hash)?;
            Some(ArchiveDescriptor {
                name: root.name().to_string(),
                hash,
                size: root.size,
                state: states.get(&root.path).cloned().unwrap_or_default(),
                meta: None,
            })
        })
        .collect();
    archives.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.hash.cmp(&b.hash)));
    archives
}
