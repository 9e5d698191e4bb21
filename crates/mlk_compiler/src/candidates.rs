//! Choosing pool files worth diffing against an unmatched installed file.

use crate::step::SourceFile;
use itertools::Itertools;
use mlk_core::Hash;
use mlk_vfs::{IndexRoot, IndexedFile};
use std::collections::HashSet;
use std::sync::Arc;

/// Suffix Mod Organizer appends to files hidden by the user.
const HIDDEN_SUFFIX: &str = ".mohidden";

/// Picks pool files that are probably earlier versions of an installed file.
///
/// Every returned candidate is diffed, and the smallest delta wins, so a strategy
/// trades compile time against the chance of finding a good base.
pub trait PatchCandidateStrategy: Send + Sync {
    fn candidates(&self, file: &SourceFile, index: &IndexRoot) -> Vec<Arc<IndexedFile>>;
}

/// The default heuristic.
///
/// 1. Files with the same name anywhere in the pool (also trying the name with a
///    trailing `.mohidden` removed).
/// 2. Otherwise, files with the same extension inside archives whose name resembles
///    the installed file's mod folder, ranked by edit distance of the file name.
#[derive(Debug, Clone)]
pub struct NameSimilarityStrategy {
    /// Upper bound on candidates from step 1.
    pub max_same_name: usize,
    /// Upper bound on candidates from step 2.
    pub max_fuzzy: usize,
}

impl Default for NameSimilarityStrategy {
    fn default() -> Self {
        Self {
            max_same_name: 8,
            max_fuzzy: 3,
        }
    }
}

impl PatchCandidateStrategy for NameSimilarityStrategy {
    fn candidates(&self, file: &SourceFile, index: &IndexRoot) -> Vec<Arc<IndexedFile>> {
        let name = file.path.file_name();
        let mut seen = HashSet::new();
        seen.insert(file.hash);

        let mut found: Vec<Arc<IndexedFile>> = index
            .files_named(name)
            .iter()
            .chain(strip_hidden(name).map(|n| index.files_named(n)).unwrap_or(&[]))
            .filter(|c| !c.is_archive && seen.insert(c.hash))
            .take(self.max_same_name)
            .cloned()
            .collect();
        if !found.is_empty() {
            return found;
        }

        let Some(folder) = mod_folder(file) else {
            return found;
        };
        let folder = normalize(folder);
        let ext = file.path.extension().map(str::to_ascii_lowercase);
        let target = name.to_ascii_lowercase();

        let roots: Vec<Hash> = index
            .roots()
            .iter()
            .filter(|r| names_resemble(&folder, &normalize(archive_stem(r.name()))))
            .map(|r| r.hash)
            .collect();
        if roots.is_empty() {
            return found;
        }

        found = index
            .all_files()
            .filter(|c| !c.is_archive && roots.contains(&c.hash_path.hash))
            .filter(|c| {
                let cand_ext = c.hash_path.parts.last().and_then(|p| p.extension());
                cand_ext.map(str::to_ascii_lowercase) == ext
            })
            .map(|c| (levenshtein(&target, &c.name().to_ascii_lowercase()), c))
            .sorted_by(|(da, a), (db, b)| da.cmp(db).then_with(|| a.hash_path.cmp(&b.hash_path)))
            .filter(|(_, c)| seen.insert(c.hash))
            .take(self.max_fuzzy)
            .map(|(_, c)| c.clone())
            .collect();
        found
    }
}

fn strip_hidden(name: &str) -> Option<&str> {
    let lower = name.to_ascii_lowercase();
    lower
        .ends_with(HIDDEN_SUFFIX)
        .then(|| &name[..name.len() - HIDDEN_SUFFIX.len()])
}

/// The folder an installed file belongs to: `mods/<name>/…` gives `<name>`,
/// otherwise the top-level folder.
fn mod_folder(file: &SourceFile) -> Option<&str> {
    let segments: Vec<&str> = file.path.segments().collect();
    match segments.as_slice() {
        [first, name, _, ..] if first.eq_ignore_ascii_case("mods") => Some(*name),
        [top, _, ..] => Some(*top),
        _ => None,
    }
}

fn archive_stem(name: &str) -> &str {
    name.split_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

/// Lowercase alphanumerics only, so `SkyUI_5_2-3863.zip` and `SkyUI 5.2` compare well.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn names_resemble(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.contains(b) || b.contains(a) {
        return true;
    }
    let longest = a.chars().count().max(b.chars().count());
    let distance = levenshtein(a, b);
    1.0 - (distance as f64 / longest as f64) >= 0.6
}

/// Classic edit distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
