//! The VFS service: indexing and resolution.
//!
//! # Indexing
//!
//! 1. Hash the source (file sources go through the [`FileHashCache`]).
//! 2. If a node with that hash is already in the in-memory arena, share it.
//! 3. Otherwise consult the [`VfsCache`]; a hit skips reading the archive entirely.
//! 4. Otherwise sniff the source with each registered [`ArchiveReader`]. If one
//!    claims it, read the entry table (sequential), then extract and index every
//!    entry in parallel, recursing up to `max_depth` levels.
//! 5. Store fully expanded archives in the cache and the arena.
//!
//! A root that cannot be opened or whose entry table is unreadable fails with
//! [`Error::IoFault`] / [`Error::CorruptArchive`]; when indexing a pool these are
//! collected per root in [`IndexReport`]. A corrupt archive *nested* inside a
//! readable one is kept as a plain file, since its bytes can still be matched.
//!
//! # Resolution
//!
//! [`Context::resolve`] walks a [`HashPath`] from its root archive on disk, opening
//! each level independently and extracting only the requested entry. Calls share
//! no state, so any number may run concurrently for the same path.

use crate::archive::{ArchiveReader, ImageAnalyzer, SNIFF_LEN};
use crate::cache::VfsCache;
use crate::error::{Error, Result};
use crate::file::{VirtualEntry, VirtualFile};
use crate::hash_cache::FileHashCache;
use crate::index::{IndexRoot, RootArchive};
use crate::source::{io_fault, ByteSource, ByteStream, SpillWriter, DEFAULT_SPILL_THRESHOLD};
use crate::zip_codec::ZipReader;
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::fs::modified_stamp;
use mlk_core::{CancellationToken, Hash, HashPath, RelativePath};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Limits and tuning for a [`Context`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VfsSettings {
    /// Archives nested deeper than this are kept as plain files.
    pub max_depth: usize,
    /// Extracted entries larger than this go to temporary files.
    pub spill_threshold: u64,
    /// Indexing threads; `0` uses one per CPU.
    pub workers: usize,
}

impl Default for VfsSettings {
    fn default() -> Self {
        Self {
            max_depth: 8,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            workers: 0,
        }
    }
}

/// A root that could not be indexed.
#[derive(Debug)]
pub struct IndexFailure {
    pub path: Utf8PathBuf,
    pub error: Error,
}

/// Summary of an [`add_roots`](Context::add_roots) call.
#[derive(Debug, Default)]
pub struct IndexReport {
    /// Roots read and expanded during this call.
    pub indexed: Vec<Utf8PathBuf>,
    /// Roots unchanged on disk since the previous call.
    pub reused: usize,
    pub failures: Vec<IndexFailure>,
    pub elapsed: Duration,
}

impl IndexReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Context {
    settings: VfsSettings,
    readers: Vec<Arc<dyn ArchiveReader>>,
    image_analyzer: Option<Arc<dyn ImageAnalyzer>>,
    cache: Arc<VfsCache>,
    hash_cache: Arc<FileHashCache>,
    /// Fully expanded nodes by content hash, shared between trees.
    arena: Mutex<HashMap<Hash, Arc<VirtualFile>>>,
    index: RwLock<Arc<IndexRoot>>,
    pool: rayon::ThreadPool,
}

impl Context {
    /// Create a context with the bundled zip reader registered.
    pub fn new(
        cache: Arc<VfsCache>,
        hash_cache: Arc<FileHashCache>,
        settings: VfsSettings,
    ) -> Result<Self> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("mlk-vfs-{}", i));
        if settings.workers > 0 {
            builder = builder.num_threads(settings.workers);
        }
        let pool = builder
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        Ok(Self {
            settings,
            readers: vec![Arc::new(ZipReader)],
            image_analyzer: None,
            cache,
            hash_cache,
            arena: Mutex::new(HashMap::new()),
            index: RwLock::new(Arc::new(IndexRoot::empty())),
            pool,
        })
    }

    /// Register an additional archive format. Readers are tried in registration order.
    pub fn with_reader(mut self, reader: Arc<dyn ArchiveReader>) -> Self {
        self.readers.push(reader);
        self
    }

    /// Analyze textures while indexing so they can be matched perceptually.
    pub fn with_image_analyzer(mut self, analyzer: Arc<dyn ImageAnalyzer>) -> Self {
        self.image_analyzer = Some(analyzer);
        self
    }

    pub fn settings(&self) -> &VfsSettings {
        &self.settings
    }

    pub fn hash_cache(&self) -> &Arc<FileHashCache> {
        &self.hash_cache
    }

    pub fn image_analyzer(&self) -> Option<&Arc<dyn ImageAnalyzer>> {
        self.image_analyzer.as_ref()
    }

    /// Current index snapshot.
    pub fn index_root(&self) -> Arc<IndexRoot> {
        self.index.read().clone()
    }

    /// Index one byte source and return its fully populated tree.
    pub fn index(
        &self,
        source: &ByteSource,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Arc<VirtualFile>> {
        let hash = match source {
            ByteSource::File(path) => self.hash_cache.hash_file(path, token)?,
            _ => source.hash(token)?,
        };
        self.pool
            .install(|| self.index_node(source, name, hash, 0, token))
            .map(|(node, _)| node)
    }

    /// Index every file under `paths` (files or directories) as a root archive and
    /// merge them into the index.
    ///
    /// Roots whose size and modification time are unchanged since they were last
    /// indexed are reused. Per-root failures are collected in the report; only
    /// cancellation aborts the call.
    pub fn add_roots(&self, paths: &[Utf8PathBuf], token: &CancellationToken) -> Result<IndexReport> {
        let start = Instant::now();
        let files = collect_files(paths)?;
        let current = self.index_root();

        let mut report = IndexReport::default();
        let mut roots = Vec::new();
        let mut pending = Vec::new();

        for path in &files {
            let metadata = match std::fs::metadata(path.as_std_path()) {
                Ok(m) => m,
                Err(e) => {
                    report.failures.push(IndexFailure {
                        path: path.clone(),
                        error: io_fault(path, e),
                    });
                    continue;
                }
            };
            match current.root_for_path(path) {
                Some(root)
                    if root.expanded
                        && root.size == metadata.len()
                        && root.modified == modified_stamp(&metadata) =>
                {
                    roots.push(root.clone());
                    report.reused += 1;
                }
                _ => pending.push((path.clone(), metadata)),
            }
        }

        tracing::info!(
            "Indexing {} archives ({} unchanged)",
            pending.len(),
            report.reused
        );

        let results: Vec<(Utf8PathBuf, Result<Arc<RootArchive>>)> = self.pool.install(|| {
            pending
                .par_iter()
                .map(|(path, metadata)| (path.clone(), self.index_file_root(path, metadata, token)))
                .collect()
        });

        for (path, result) in results {
            match result {
                Ok(root) => {
                    report.indexed.push(path);
                    roots.push(root);
                }
                Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::warn!("Failed to index {}: {}", path, e);
                    report.failures.push(IndexFailure { path, error: e });
                }
            }
        }
        token.check()?;

        let superseded: HashSet<Utf8PathBuf> = files.into_iter().collect();
        let next = current.integrate(roots, &superseded);
        tracing::info!(
            "VFS index holds {} roots, {} files",
            next.roots().len(),
            next.len()
        );
        *self.index.write() = Arc::new(next);

        report.elapsed = start.elapsed();
        Ok(report)
    }

    /// Make an archive on disk resolvable by `hash` without reading its contents.
    ///
    /// Used by the installer for freshly downloaded archives whose hash has already
    /// been verified. A cached tree for `hash` is attached if one exists.
    pub fn register_archive(&self, path: &Utf8Path, hash: Hash) -> Result<()> {
        let metadata = std::fs::metadata(path.as_std_path()).map_err(|e| io_fault(path, e))?;
        let (file, expanded) = match self.cache.get(hash)? {
            Some(cached) => (self.adopt(&cached), true),
            None => (Arc::new(VirtualFile::leaf(hash, metadata.len())), false),
        };
        let root = Arc::new(RootArchive {
            path: path.to_path_buf(),
            hash,
            size: metadata.len(),
            modified: modified_stamp(&metadata),
            file,
            expanded,
        });

        let mut index = self.index.write();
        *index = Arc::new(index.integrate(vec![root], &HashSet::new()));
        Ok(())
    }

    /// Stream the bytes of the file at `hash_path`.
    pub fn resolve(&self, hash_path: &HashPath) -> Result<ByteStream> {
        self.resolve_source(hash_path, &CancellationToken::new())?
            .stream()
    }

    /// [`resolve`](Self::resolve) taking per-level `(hash, entry)` pairs.
    pub fn resolve_segments(&self, segments: &[(Hash, Option<RelativePath>)]) -> Result<ByteStream> {
        let hash_path = HashPath::from_segments(segments).ok_or(Error::UnknownRoot(Hash::ZERO))?;
        self.resolve(&hash_path)
    }

    /// Extract the file at `hash_path` into a reopenable source.
    pub fn resolve_source(&self, hash_path: &HashPath, token: &CancellationToken) -> Result<ByteSource> {
        let index = self.index_root();
        let root = index
            .root(hash_path.hash)
            .ok_or(Error::UnknownRoot(hash_path.hash))?;

        let mut source = ByteSource::File(root.path.clone());
        let mut name = root.name().to_string();

        for part in &hash_path.parts {
            token.check()?;
            let reader = self
                .reader_for(&source, &name)?
                .ok_or_else(|| Error::NotAContainer {
                    hash_path: hash_path.clone(),
                    entry: name.clone(),
                })?;
            let entries = reader.list_entries(&source)?;
            let entry = entries
                .iter()
                .find(|e| &e.path == part)
                .or_else(|| entries.iter().find(|e| e.path.eq_ignore_case(part)))
                .ok_or_else(|| Error::EntryNotFound {
                    hash_path: hash_path.clone(),
                    entry: part.to_string(),
                })?;

            let mut sink = SpillWriter::new(entry.size, self.settings.spill_threshold, token)?;
            reader.extract_entry(&source, entry, &mut sink)?;
            source = sink.finish()?.0;
            name = part.to_string();
        }

        Ok(source)
    }

    /// Read the whole file at `hash_path` into memory.
    pub fn resolve_bytes(&self, hash_path: &HashPath, token: &CancellationToken) -> Result<Vec<u8>> {
        self.resolve_source(hash_path, token)?.read_all()
    }

    fn index_file_root(
        &self,
        path: &Utf8Path,
        metadata: &std::fs::Metadata,
        token: &CancellationToken,
    ) -> Result<Arc<RootArchive>> {
        let hash = self.hash_cache.hash_file(path, token)?;
        let source = ByteSource::File(path.to_path_buf());
        let name = path.file_name().unwrap_or(path.as_str());
        let (file, _) = self.index_node(&source, name, hash, 0, token)?;

        tracing::debug!("Indexed {} ({}, {} nodes)", path, hash, file.node_count());
        Ok(Arc::new(RootArchive {
            path: path.to_path_buf(),
            hash,
            size: metadata.len(),
            modified: modified_stamp(metadata),
            file,
            expanded: true,
        }))
    }

    /// Returns the node and whether its whole subtree was expanded.
    fn index_node(
        &self,
        source: &ByteSource,
        name: &str,
        hash: Hash,
        depth: usize,
        token: &CancellationToken,
    ) -> Result<(Arc<VirtualFile>, bool)> {
        token.check()?;

        if let Some(existing) = self.arena.lock().get(&hash).cloned() {
            return Ok((existing, true));
        }
        if let Some(cached) = self.cache.get(hash)? {
            tracing::trace!("VFS cache hit for {} ({})", name, hash);
            return Ok((self.adopt(&cached), true));
        }

        let size = source.len()?;
        let image_state = self.analyze_image(source, name);
        let mut node = VirtualFile {
            hash,
            size,
            image_state,
            children: Vec::new(),
        };

        let Some(reader) = self.reader_for(source, name)? else {
            return Ok((self.intern(node), true));
        };

        if depth >= self.settings.max_depth {
            tracing::warn!(
                "Not expanding {} ({}): nested deeper than {} levels",
                name,
                hash,
                self.settings.max_depth
            );
            return Ok((Arc::new(node), false));
        }

        let entries = match reader.list_entries(source) {
            Ok(entries) => entries,
            Err(e) if depth == 0 => return Err(e),
            Err(e) => {
                tracing::warn!("Treating unreadable nested archive {} as a plain file: {}", name, e);
                return Ok((self.intern(node), true));
            }
        };

        let children: Vec<(VirtualEntry, bool)> = entries
            .par_iter()
            .map(|entry| {
                token.check()?;
                let mut sink = SpillWriter::new(entry.size, self.settings.spill_threshold, token)?;
                reader.extract_entry(source, entry, &mut sink)?;
                let (child_source, child_hash) = sink.finish()?;
                let (file, complete) =
                    self.index_node(&child_source, entry.path.as_str(), child_hash, depth + 1, token)?;
                Ok((
                    VirtualEntry {
                        name: entry.path.clone(),
                        file,
                    },
                    complete,
                ))
            })
            .collect::<Result<_>>()?;

        let complete = children.iter().all(|(_, complete)| *complete);
        node.children = children.into_iter().map(|(entry, _)| entry).collect();

        tracing::debug!(
            "Expanded {} ({}): {} entries via {}",
            name,
            hash,
            node.children.len(),
            reader.name()
        );

        if !complete {
            return Ok((Arc::new(node), false));
        }
        self.cache.put(&node)?;
        Ok((self.intern(node), true))
    }

    fn analyze_image(&self, source: &ByteSource, name: &str) -> Option<crate::archive::ImageState> {
        let analyzer = self.image_analyzer.as_ref()?;
        if !analyzer.can_analyze(name) {
            return None;
        }
        match analyzer.analyze(source) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Could not analyze image {}: {}", name, e);
                None
            }
        }
    }

    fn reader_for(&self, source: &ByteSource, name: &str) -> Result<Option<Arc<dyn ArchiveReader>>> {
        let header = source.header(SNIFF_LEN)?;
        Ok(self
            .readers
            .iter()
            .find(|r| r.can_read(&header, name))
            .cloned())
    }

    fn intern(&self, node: VirtualFile) -> Arc<VirtualFile> {
        self.arena
            .lock()
            .entry(node.hash)
            .or_insert_with(|| Arc::new(node))
            .clone()
    }

    /// Intern a tree loaded from the cache, sharing subtrees already in the arena.
    fn adopt(&self, node: &VirtualFile) -> Arc<VirtualFile> {
        if let Some(existing) = self.arena.lock().get(&node.hash).cloned() {
            return existing;
        }
        let children = node
            .children
            .iter()
            .map(|c| VirtualEntry {
                name: c.name.clone(),
                file: self.adopt(&c.file),
            })
            .collect();
        self.intern(VirtualFile {
            hash: node.hash,
            size: node.size,
            image_state: node.image_state.clone(),
            children,
        })
    }
}

/// Expand directories into the regular files below them, sorted.
fn collect_files(paths: &[Utf8PathBuf]) -> Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.as_std_path().is_file() {
            files.push(path.clone());
            continue;
        }
        for entry in walkdir::WalkDir::new(path.as_std_path()).follow_links(true) {
            let entry = entry.map_err(|e| {
                let io = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                io_fault(path, io)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            match Utf8PathBuf::from_path_buf(entry.into_path()) {
                Ok(p) => files.push(p),
                Err(p) => tracing::warn!("Skipping non-UTF-8 path: {}", p.display()),
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}
