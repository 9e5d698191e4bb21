//! Immutable lookup tables over every indexed root archive.
//!
//! An [`IndexRoot`] is rebuilt whenever roots are added and swapped in atomically,
//! so readers holding an `Arc<IndexRoot>` always see a consistent snapshot.
//!
//! Files sharing a content hash are ordered by preference: shallowest hash-path
//! first, then the most recently modified root archive, then hash-path text.
//! [`best_match`](IndexRoot::best_match) therefore picks the same source on every
//! run over the same pool.

use crate::archive::ImageState;
use crate::file::VirtualFile;
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::{Hash, HashPath};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A file on disk at the top of an archive tree.
#[derive(Debug)]
pub struct RootArchive {
    pub path: Utf8PathBuf,
    pub hash: Hash,
    pub size: u64,
    /// Modification stamp, see [`mlk_core::fs::modified_stamp`].
    pub modified: u64,
    pub file: Arc<VirtualFile>,
    /// `false` for roots registered by hash without expanding their contents.
    pub expanded: bool,
}

impl RootArchive {
    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or(self.path.as_str())
    }
}

/// One occurrence of a file somewhere in the pool.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    pub hash_path: HashPath,
    pub hash: Hash,
    pub size: u64,
    pub image_state: Option<ImageState>,
    pub is_archive: bool,
    pub root: Arc<RootArchive>,
}

impl IndexedFile {
    /// File name at the deepest level (the root's file name for a root).
    pub fn name(&self) -> &str {
        self.hash_path.file_name().unwrap_or_else(|| self.root.name())
    }

    /// File stem of [`name`](Self::name).
    pub fn stem(&self) -> &str {
        let name = self.name();
        match name.rfind('.') {
            Some(0) | None => name,
            Some(idx) => &name[..idx],
        }
    }

    pub fn depth(&self) -> usize {
        self.hash_path.depth()
    }
}

fn preference(a: &Arc<IndexedFile>, b: &Arc<IndexedFile>) -> Ordering {
    a.depth()
        .cmp(&b.depth())
        .then_with(|| b.root.modified.cmp(&a.root.modified))
        .then_with(|| a.hash_path.cmp(&b.hash_path))
        .then_with(|| a.root.path.cmp(&b.root.path))
}

#[derive(Debug, Default)]
pub struct IndexRoot {
    roots: Vec<Arc<RootArchive>>,
    by_root_hash: HashMap<Hash, Arc<RootArchive>>,
    by_path: HashMap<Utf8PathBuf, Arc<RootArchive>>,
    by_hash: HashMap<Hash, Vec<Arc<IndexedFile>>>,
    /// Lowercased file name -> occurrences.
    by_name: HashMap<String, Vec<Arc<IndexedFile>>>,
    file_count: usize,
}

impl IndexRoot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(mut roots: Vec<Arc<RootArchive>>) -> Self {
        roots.sort_by(|a, b| a.path.cmp(&b.path));

        let mut by_root_hash = HashMap::new();
        let mut by_path = HashMap::new();
        let mut by_hash: HashMap<Hash, Vec<Arc<IndexedFile>>> = HashMap::new();
        let mut by_name: HashMap<String, Vec<Arc<IndexedFile>>> = HashMap::new();
        let mut file_count = 0;

        for root in &roots {
            by_root_hash.entry(root.hash).or_insert_with(|| root.clone());
            by_path.insert(root.path.clone(), root.clone());

            root.file.walk(&HashPath::new(root.hash), &mut |hash_path, node| {
                let file = Arc::new(IndexedFile {
                    hash_path: hash_path.clone(),
                    hash: node.hash,
                    size: node.size,
                    image_state: node.image_state.clone(),
                    is_archive: node.is_archive(),
                    root: root.clone(),
                });
                by_name
                    .entry(file.name().to_ascii_lowercase())
                    .or_default()
                    .push(file.clone());
                by_hash.entry(node.hash).or_default().push(file);
                file_count += 1;
            });
        }

        for files in by_hash.values_mut() {
            files.sort_by(preference);
        }
        for files in by_name.values_mut() {
            files.sort_by(preference);
        }

        Self {
            roots,
            by_root_hash,
            by_path,
            by_hash,
            by_name,
            file_count,
        }
    }

    /// New index with `replaced` roots swapped in.
    ///
    /// Existing roots at a `superseded` path are dropped even when nothing
    /// replaces them, so a file that was rescanned but failed to index stops
    /// resolving.
    pub fn integrate(&self, replaced: Vec<Arc<RootArchive>>, superseded: &HashSet<Utf8PathBuf>) -> Self {
        let replaced_paths: HashSet<&Utf8Path> = replaced.iter().map(|r| r.path.as_path()).collect();
        let mut roots: Vec<Arc<RootArchive>> = self
            .roots
            .iter()
            .filter(|r| !replaced_paths.contains(r.path.as_path()) && !superseded.contains(&r.path))
            .cloned()
            .collect();
        roots.extend(replaced);
        Self::build(roots)
    }

    pub fn roots(&self) -> &[Arc<RootArchive>] {
        &self.roots
    }

    pub fn root(&self, hash: Hash) -> Option<&Arc<RootArchive>> {
        self.by_root_hash.get(&hash)
    }

    pub fn root_for_path(&self, path: &Utf8Path) -> Option<&Arc<RootArchive>> {
        self.by_path.get(path)
    }

    /// Every occurrence of `hash`, best first.
    pub fn files_with_hash(&self, hash: Hash) -> &[Arc<IndexedFile>] {
        self.by_hash.get(&hash).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn best_match(&self, hash: Hash) -> Option<&Arc<IndexedFile>> {
        self.files_with_hash(hash).first()
    }

    /// Every file whose name matches case-insensitively, best first.
    pub fn files_named(&self, name: &str) -> &[Arc<IndexedFile>] {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Node addressed by `hash_path`, if the tree has been expanded that far.
    pub fn file_for_hash_path(&self, hash_path: &HashPath) -> Option<Arc<VirtualFile>> {
        self.root(hash_path.hash)?.file.descend(&hash_path.parts)
    }

    /// Every file occurrence, in no particular order.
    pub fn all_files(&self) -> impl Iterator<Item = &Arc<IndexedFile>> {
        self.by_hash.values().flatten()
    }

    pub fn contains_hash(&self, hash: Hash) -> bool {
        self.by_hash.contains_key(&hash)
    }

    /// Number of file occurrences, roots included.
    pub fn len(&self) -> usize {
        self.file_count
    }

    pub fn is_empty(&self) -> bool {
        self.file_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::VirtualEntry;
    use mlk_core::RelativePath;

    fn rel(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    fn root(path: &str, hash: u64, modified: u64, children: Vec<(&str, VirtualFile)>) -> Arc<RootArchive> {
        let file = VirtualFile {
            hash: Hash(hash),
            size: 100,
            image_state: None,
            children: children
                .into_iter()
                .map(|(name, file)| VirtualEntry {
                    name: rel(name),
                    file: Arc::new(file),
                })
                .collect(),
        };
        Arc::new(RootArchive {
            path: Utf8PathBuf::from(path),
            hash: Hash(hash),
            size: 100,
            modified,
            file: Arc::new(file),
            expanded: true,
        })
    }

    #[test]
    fn test_prefers_shallow_then_recent() {
        let nested = VirtualFile {
            hash: Hash(20),
            size: 50,
            image_state: None,
            children: vec![VirtualEntry {
                name: rel("texture.dds"),
                file: Arc::new(VirtualFile::leaf(Hash(99), 4)),
            }],
        };
        let index = IndexRoot::build(vec![
            root("/dl/old.zip", 1, 10, vec![("texture.dds", VirtualFile::leaf(Hash(99), 4))]),
            root("/dl/new.zip", 2, 20, vec![("texture.dds", VirtualFile::leaf(Hash(99), 4))]),
            root("/dl/deep.zip", 3, 30, vec![("inner.zip", nested)]),
        ]);

        let matches = index.files_with_hash(Hash(99));
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].root.path, "/dl/new.zip");
        assert_eq!(matches[1].root.path, "/dl/old.zip");
        assert_eq!(matches[2].depth(), 2);
        assert_eq!(index.best_match(Hash(99)).unwrap().hash_path.hash, Hash(2));
    }

    #[test]
    fn test_integrate_drops_superseded_roots() {
        let index = IndexRoot::build(vec![
            root("/dl/a.zip", 1, 10, vec![]),
            root("/dl/b.zip", 2, 10, vec![]),
            root("/dl/c.zip", 3, 10, vec![]),
        ]);
        let superseded: HashSet<Utf8PathBuf> = ["/dl/a.zip", "/dl/b.zip"].into_iter().map(Utf8PathBuf::from).collect();

        let next = index.integrate(vec![root("/dl/a.zip", 4, 20, vec![])], &superseded);

        let mut paths: Vec<&str> = next.roots().iter().map(|r| r.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/dl/a.zip", "/dl/c.zip"]);
        assert_eq!(next.root_for_path(Utf8Path::new("/dl/a.zip")).unwrap().hash, Hash(4));
        assert!(next.root(Hash(2)).is_none());
    }

    #[test]
    fn test_lookup_by_name_and_path() {
        let index = IndexRoot::build(vec![root(
            "/dl/a.zip",
            1,
            0,
            vec![("Data/Plugin_v1.esp", VirtualFile::leaf(Hash(5), 4))],
        )]);

        assert_eq!(index.files_named("plugin_v1.ESP").len(), 1);
        assert_eq!(index.files_named("a.zip")[0].hash, Hash(1));
        assert!(index.root_for_path(Utf8Path::new("/dl/a.zip")).is_some());
        assert_eq!(index.len(), 2);

        let hp = HashPath::new(Hash(1)).join(rel("data/plugin_v1.esp"));
        assert_eq!(index.file_for_hash_path(&hp).unwrap().hash, Hash(5));
    }

    #[test]
    fn test_integrate_replaces_and_removes() {
        let first = IndexRoot::build(vec![
            root("/dl/a.zip", 1, 0, vec![]),
            root("/dl/b.zip", 2, 0, vec![]),
        ]);
        let removed: HashSet<Utf8PathBuf> = [Utf8PathBuf::from("/dl/b.zip")].into_iter().collect();
        let second = first.integrate(vec![root("/dl/a.zip", 7, 1, vec![])], &removed);

        assert_eq!(second.roots().len(), 1);
        assert!(second.root(Hash(7)).is_some());
        assert!(second.root(Hash(1)).is_none());
        assert!(second.root(Hash(2)).is_none());
    }
}
