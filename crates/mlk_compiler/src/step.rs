//! The compilation step contract and the state shared by every step.

use crate::candidates::PatchCandidateStrategy;
use crate::error::Result;
use crate::settings::{CompiledIgnore, CompilerSettings};
use mlk_core::{CancellationToken, Hash, RelativePath};
use mlk_patch::BinaryPatchCache;
use mlk_recipe::{Directive, DirectiveKind, RemapRoots};
use mlk_vfs::{ArchiveReader, ByteSource, ContainerCodec, Context, ImageAnalyzer, IndexRoot, IndexedFile};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// An installed file to be described, or a member of a deconstructed container.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Destination relative to the install directory.
    pub path: RelativePath,
    pub hash: Hash,
    pub size: u64,
    pub bytes: ByteSource,
}

impl SourceFile {
    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.read_all()?)
    }

    /// A directive producing this file.
    pub fn directive(&self, kind: DirectiveKind) -> Directive {
        Directive::new(self.path.clone(), self.hash, self.size, kind)
    }
}

/// What a step decided for one file.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub directive: Directive,
    /// Package data entries the directive reads.
    pub data: Vec<(String, Vec<u8>)>,
    /// Extra directives that must run first, such as staged container members.
    pub staged: Vec<Directive>,
}

impl Resolution {
    pub fn new(directive: Directive) -> Self {
        Self {
            directive,
            data: Vec::new(),
            staged: Vec::new(),
        }
    }

    pub fn with_data(mut self, id: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.data.push((id.into(), bytes));
        self
    }
}

/// One rule in the matching stack.
///
/// Steps run in order for every file; the first to return `Some` decides it.
pub trait CompilationStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>>;
}

/// A container format the compiler can take apart and the installer can rebuild.
#[derive(Clone)]
pub struct ContainerSupport {
    pub reader: Arc<dyn ArchiveReader>,
    pub codec: Arc<dyn ContainerCodec>,
}

/// Read-only state of one compile run.
pub struct CompileContext<'a> {
    pub settings: &'a CompilerSettings,
    pub vfs: &'a Context,
    pub index: Arc<IndexRoot>,
    pub patches: &'a BinaryPatchCache,
    pub containers: &'a [ContainerSupport],
    pub image_analyzer: Option<&'a Arc<dyn ImageAnalyzer>>,
    pub candidates: &'a dyn PatchCandidateStrategy,
    pub remap: RemapRoots,
    pub token: &'a CancellationToken,
    pub(crate) ignore: CompiledIgnore,
    /// Every installed file by path, for merges.
    pub(crate) files: HashMap<RelativePath, SourceFile>,
    /// Pool images by lowercased file stem.
    pub(crate) images_by_stem: HashMap<String, Vec<Arc<IndexedFile>>>,
}

impl CompileContext<'_> {
    pub fn file(&self, path: &RelativePath) -> Option<&SourceFile> {
        self.files.get(path)
    }

    /// Pool images sharing `stem`, best first.
    pub fn images_with_stem(&self, stem: &str) -> &[Arc<IndexedFile>] {
        self.images_by_stem
            .get(&stem.to_ascii_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

pub(crate) fn index_images(index: &IndexRoot) -> HashMap<String, Vec<Arc<IndexedFile>>> {
    let mut by_stem: HashMap<String, Vec<Arc<IndexedFile>>> = HashMap::new();
    for file in index.all_files().filter(|f| f.image_state.is_some()) {
        by_stem
            .entry(file.stem().to_ascii_lowercase())
            .or_default()
            .push(file.clone());
    }
    for files in by_stem.values_mut() {
        files.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| b.root.modified.cmp(&a.root.modified))
                .then_with(|| a.hash_path.cmp(&b.hash_path))
        });
        let mut seen = HashSet::new();
        files.retain(|f| seen.insert(f.hash));
    }
    by_stem
}
