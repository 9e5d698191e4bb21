use crate::archive::ImageState;
use mlk_core::{Hash, HashPath, RelativePath};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One file reachable from a root source, with its expanded children if it is an
/// archive.
///
/// The hash covers the file's own (possibly compressed) bytes and never depends on
/// the children. Identical sub-archives share a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualFile {
    pub hash: Hash,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_state: Option<ImageState>,
    /// Entries in container order. Empty for plain files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<VirtualEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualEntry {
    pub name: RelativePath,
    pub file: Arc<VirtualFile>,
}

impl VirtualFile {
    pub fn leaf(hash: Hash, size: u64) -> Self {
        Self {
            hash,
            size,
            image_state: None,
            children: Vec::new(),
        }
    }

    pub fn is_archive(&self) -> bool {
        !self.children.is_empty()
    }

    /// Child entry by name; exact match first, then ASCII case-insensitive.
    pub fn child(&self, name: &RelativePath) -> Option<&Arc<VirtualFile>> {
        self.children
            .iter()
            .find(|c| &c.name == name)
            .or_else(|| self.children.iter().find(|c| c.name.eq_ignore_case(name)))
            .map(|c| &c.file)
    }

    /// Follow `parts` down the tree.
    pub fn descend(self: &Arc<Self>, parts: &[RelativePath]) -> Option<Arc<VirtualFile>> {
        let mut node = self.clone();
        for part in parts {
            node = node.child(part)?.clone();
        }
        Some(node)
    }

    /// Visit this node and every descendant, depth first, with its hash-path.
    pub fn walk<F>(&self, at: &HashPath, visit: &mut F)
    where
        F: FnMut(&HashPath, &VirtualFile),
    {
        visit(at, self);
        for entry in &self.children {
            entry.file.walk(&at.join(entry.name.clone()), visit);
        }
    }

    /// Number of nodes in this subtree, counting shared nodes once per occurrence.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.file.node_count()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    fn tree() -> Arc<VirtualFile> {
        let inner = Arc::new(VirtualFile {
            hash: Hash(2),
            size: 10,
            image_state: None,
            children: vec![VirtualEntry {
                name: rel("Textures/T.dds"),
                file: Arc::new(VirtualFile::leaf(Hash(3), 4)),
            }],
        });
        Arc::new(VirtualFile {
            hash: Hash(1),
            size: 100,
            image_state: None,
            children: vec![VirtualEntry {
                name: rel("inner.zip"),
                file: inner,
            }],
        })
    }

    #[test]
    fn test_descend_is_case_insensitive_fallback() {
        let root = tree();
        let node = root.descend(&[rel("inner.zip"), rel("textures/t.dds")]).unwrap();
        assert_eq!(node.hash, Hash(3));
        assert!(root.descend(&[rel("missing")]).is_none());
    }

    #[test]
    fn test_walk_yields_hash_paths() {
        let root = tree();
        let mut seen = Vec::new();
        root.walk(&HashPath::new(root.hash), &mut |hp, f| seen.push((hp.to_string(), f.hash)));
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].0, "0000000000000001|inner.zip|Textures/T.dds");
        assert_eq!(root.node_count(), 3);
    }
}
