//! Relative paths and hash-paths.
//!
//! A [`RelativePath`] is always forward-slash separated with no empty, `.` or `..`
//! segments, so the same file gets the same string on every platform and inside
//! every archive format.
//!
//! A [`HashPath`] addresses a file that may sit several archives deep: the hash of
//! the outermost (root) archive followed by the path of the next entry inside each
//! nesting level. A hash-path with no parts addresses the root archive itself.

use crate::error::{Error, Result};
use crate::hash::Hash;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Normalize and validate a relative path.
    ///
    /// Backslashes become `/`, empty and `.` segments are dropped. Absolute paths,
    /// drive-prefixed paths and `..` segments are rejected.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let raw = path.as_ref();
        let unified = raw.replace('\\', "/");

        if unified.starts_with('/') {
            return Err(invalid(raw, "absolute path"));
        }
        if unified.len() >= 2 && unified.as_bytes()[1] == b':' {
            return Err(invalid(raw, "drive-prefixed path"));
        }

        let mut segments = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(invalid(raw, "parent directory segment")),
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(invalid(raw, "empty path"));
        }

        Ok(RelativePath(segments.join("/")))
    }

    /// Build a relative path from `full` by stripping the `base` directory.
    pub fn from_base(base: &Utf8Path, full: &Utf8Path) -> Result<Self> {
        let stripped = full
            .strip_prefix(base)
            .map_err(|_| invalid(full.as_str(), "not under base directory"))?;
        RelativePath::new(stripped.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// File name without its final extension.
    pub fn file_stem(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => name,
            Some(idx) => &name[..idx],
        }
    }

    /// Final extension without the dot, if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&name[idx + 1..]),
        }
    }

    pub fn has_extension(&self, ext: &str) -> bool {
        self.extension()
            .is_some_and(|e| e.eq_ignore_ascii_case(ext.trim_start_matches('.')))
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }

    /// First segment (the top-level directory, or the file itself).
    pub fn top_level(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> Option<RelativePath> {
        self.0
            .rfind('/')
            .map(|idx| RelativePath(self.0[..idx].to_string()))
    }

    pub fn join(&self, other: &RelativePath) -> RelativePath {
        RelativePath(format!("{}/{}", self.0, other.0))
    }

    pub fn starts_with(&self, prefix: &RelativePath) -> bool {
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// Path with `prefix` removed, if this path lies under it.
    pub fn strip_prefix(&self, prefix: &RelativePath) -> Option<RelativePath> {
        if self.0.len() > prefix.0.len() && self.starts_with(prefix) {
            Some(RelativePath(self.0[prefix.0.len() + 1..].to_string()))
        } else {
            None
        }
    }

    pub fn eq_ignore_case(&self, other: &RelativePath) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }

    /// Resolve against a base directory on disk.
    pub fn to_path(&self, base: &Utf8Path) -> Utf8PathBuf {
        self.segments().fold(base.to_path_buf(), |acc, s| acc.join(s))
    }
}

fn invalid(path: &str, reason: &'static str) -> Error {
    Error::InvalidPath {
        path: path.to_string(),
        reason,
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0
    }
}

impl TryFrom<String> for RelativePath {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        RelativePath::new(s)
    }
}

impl TryFrom<&str> for RelativePath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        RelativePath::new(s)
    }
}

impl AsRef<str> for RelativePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Address of a file reachable from a root archive through zero or more nested
/// archives.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct HashPath {
    /// Content hash of the root archive.
    pub hash: Hash,
    /// Entry path inside each nesting level, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<RelativePath>,
}

impl HashPath {
    /// Hash-path addressing a root archive itself.
    pub fn new(root: Hash) -> Self {
        Self {
            hash: root,
            parts: Vec::new(),
        }
    }

    pub fn from_parts(root: Hash, parts: Vec<RelativePath>) -> Self {
        Self { hash: root, parts }
    }

    /// Build a hash-path from per-level `(hash, entry)` pairs.
    ///
    /// The first pair's hash is the root archive hash. The entry of each pair is
    /// the path to open inside that level; a `None` entry ends the path. Hashes
    /// after the first describe intermediate containers and are not needed to
    /// walk the path.
    pub fn from_segments(segments: &[(Hash, Option<RelativePath>)]) -> Option<Self> {
        let (root, _) = segments.first()?;
        let parts = segments
            .iter()
            .map_while(|(_, entry)| entry.clone())
            .collect();
        Some(Self { hash: *root, parts })
    }

    /// Per-level `(hash, entry)` pairs. Only the root hash is known here, so
    /// intermediate levels carry [`Hash::ZERO`].
    pub fn to_segments(&self) -> Vec<(Hash, Option<RelativePath>)> {
        let mut segments = Vec::with_capacity(self.parts.len() + 1);
        for (idx, part) in self.parts.iter().enumerate() {
            let hash = if idx == 0 { self.hash } else { Hash::ZERO };
            segments.push((hash, Some(part.clone())));
        }
        if segments.is_empty() {
            segments.push((self.hash, None));
        }
        segments
    }

    /// Number of nesting levels below the root archive.
    pub fn depth(&self) -> usize {
        self.parts.len()
    }

    pub fn is_root(&self) -> bool {
        self.parts.is_empty()
    }

    /// Extend by one nesting level.
    pub fn join(&self, part: RelativePath) -> Self {
        let mut parts = self.parts.clone();
        parts.push(part);
        Self {
            hash: self.hash,
            parts,
        }
    }

    /// The hash-path of the containing archive, or `None` for a root.
    pub fn parent(&self) -> Option<Self> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Self {
            hash: self.hash,
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }

    /// Entry name at the deepest level.
    pub fn file_name(&self) -> Option<&str> {
        self.parts.last().map(|p| p.file_name())
    }
}

impl fmt::Display for HashPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash)?;
        for part in &self.parts {
            write!(f, "|{}", part)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HashPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashPath({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rel(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    #[test]
    fn test_normalizes_separators() {
        assert_eq!(rel("textures\\armor\\\\t1.dds").as_str(), "textures/armor/t1.dds");
        assert_eq!(rel("./meshes/./a.nif").as_str(), "meshes/a.nif");
    }

    #[test]
    fn test_rejects_escaping_paths() {
        assert!(RelativePath::new("/etc/passwd").is_err());
        assert!(RelativePath::new("C:\\Games").is_err());
        assert!(RelativePath::new("a/../../b").is_err());
        assert!(RelativePath::new("").is_err());
    }

    #[test]
    fn test_name_parts() {
        let p = rel("mods/Armor/textures/t1_n.dds");
        assert_eq!(p.file_name(), "t1_n.dds");
        assert_eq!(p.file_stem(), "t1_n");
        assert_eq!(p.extension(), Some("dds"));
        assert!(p.has_extension(".DDS"));
        assert_eq!(p.top_level(), "mods");
        assert_eq!(p.depth(), 4);
        assert_eq!(p.parent().unwrap().as_str(), "mods/Armor/textures");
        assert_eq!(rel(".gitignore").extension(), None);
    }

    #[test]
    fn test_prefix_handling() {
        let prefix = rel("TEMP_BSA_FILES/abc");
        let member = rel("TEMP_BSA_FILES/abc/meshes/a.nif");
        assert!(member.starts_with(&prefix));
        assert!(!rel("TEMP_BSA_FILES/abcd/x").starts_with(&prefix));
        assert_eq!(member.strip_prefix(&prefix).unwrap().as_str(), "meshes/a.nif");
    }

    #[test]
    fn test_hash_path_display_and_parent() {
        let hp = HashPath::new(Hash(1))
            .join(rel("inner.zip"))
            .join(rel("textures/t.dds"));
        assert_eq!(hp.to_string(), "0000000000000001|inner.zip|textures/t.dds");
        assert_eq!(hp.depth(), 2);
        assert_eq!(hp.file_name(), Some("t.dds"));
        assert_eq!(hp.parent().unwrap().depth(), 1);
        assert!(HashPath::new(Hash(1)).parent().is_none());
    }

    #[test]
    fn test_hash_path_segments() {
        let hp = HashPath::new(Hash(9)).join(rel("a.zip")).join(rel("b.txt"));
        let segments = hp.to_segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], (Hash(9), Some(rel("a.zip"))));
        assert_eq!(HashPath::from_segments(&segments), Some(hp));

        let root = HashPath::new(Hash(3));
        assert_eq!(HashPath::from_segments(&root.to_segments()), Some(root));
    }

    #[test]
    fn test_hash_path_json_shape() {
        let hp = HashPath::new(Hash(0xab)).join(rel("texture.dds"));
        let json = serde_json::to_value(&hp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "hash": "00000000000000ab", "parts": ["texture.dds"] })
        );
    }

    proptest! {
        #[test]
        fn test_normalization_is_idempotent(segments in proptest::collection::vec("[a-zA-Z0-9_ .-]{1,8}", 1..5)) {
            let joined = segments.join("\\");
            if let Ok(once) = RelativePath::new(&joined) {
                let twice = RelativePath::new(once.as_str()).unwrap();
                prop_assert_eq!(once, twice);
            }
        }
    }
}
