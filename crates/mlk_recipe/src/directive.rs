//! Per-file reconstruction instructions.
//!
//! A [`Directive`] says how to produce one installed file: its destination, the hash
//! and size the result must have, and a [`DirectiveKind`] describing where the bytes
//! come from. In JSON the kind is flattened into the directive and discriminated by
//! a `"$type"` field:
//!
//! ```json
//! {"$type": "FromArchive", "to": "Data/texture.dds", "hash": "…", "size": 1024,
//!  "archiveHashPath": {"hash": "…", "parts": ["textures/texture.dds"]}}
//! ```
//!
//! Unrecognized `"$type"` values deserialize to [`DirectiveKind::Unknown`] with the
//! raw object preserved, and serialize back unchanged.

use mlk_core::{Hash, HashPath, RelativePath};
use mlk_vfs::{ContainerState, ImageState, MemberState};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// `"$type"` names of every kind this version understands.
pub const KNOWN_TYPES: &[&str] = &[
    "FromArchive",
    "PatchedFromArchive",
    "TransformedTexture",
    "CreateBSA",
    "InlineFile",
    "RemappedInlineFile",
    "MergedPatch",
    "NoMatch",
    "IgnoredDirectly",
];

/// Data id under which the bytes of an inlined file are stored in a package.
pub fn inline_data_id(hash: Hash) -> String {
    format!("inline-{}", hash)
}

/// Data id under which the delta from `from` to `to` is stored in a package.
pub fn patch_data_id(from: Hash, to: Hash) -> String {
    format!("patch-{}-{}", from, to)
}

/// One input of a [`DirectiveKind::MergedPatch`]: a file produced by another directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePatch {
    pub relative_path: RelativePath,
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all_fields = "camelCase")]
pub enum DirectiveKind {
    /// Copy a file out of an archive unchanged.
    FromArchive { archive_hash_path: HashPath },

    /// Apply a stored delta to a file out of an archive.
    PatchedFromArchive {
        archive_hash_path: HashPath,
        from_hash: Hash,
        patch_id: String,
    },

    /// Re-encode a perceptually matching texture to the recorded image state.
    TransformedTexture {
        archive_hash_path: HashPath,
        image_state: ImageState,
    },

    /// Assemble a container from members staged under `TEMP_BSA_FILES/<temp_id>/`.
    #[serde(rename = "CreateBSA")]
    CreateBsa {
        temp_id: String,
        state: ContainerState,
        file_states: Vec<MemberState>,
    },

    /// Bytes stored in the recipe package.
    InlineFile { source_data_id: String },

    /// Stored bytes with install-path tokens to substitute.
    RemappedInlineFile { source_data_id: String },

    /// Concatenate the outputs of other directives and apply a stored delta.
    MergedPatch {
        sources: Vec<SourcePatch>,
        patch_id: String,
    },

    /// Compile-time only: the file could not be traced.
    NoMatch { reason: String },

    /// Compile-time only: the file was excluded by an ignore rule.
    IgnoredDirectly { reason: String },

    /// A kind written by a newer version.
    #[serde(skip)]
    Unknown { type_name: String, raw: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    /// Destination relative to the install directory.
    pub to: RelativePath,
    /// Hash the produced file must have.
    pub hash: Hash,
    /// Size the produced file must have.
    pub size: u64,
    pub kind: DirectiveKind,
}

impl Directive {
    pub fn new(to: RelativePath, hash: Hash, size: u64, kind: DirectiveKind) -> Self {
        Self {
            to,
            hash,
            size,
            kind,
        }
    }

    pub fn type_name(&self) -> &str {
        match &self.kind {
            DirectiveKind::FromArchive { .. } => "FromArchive",
            DirectiveKind::PatchedFromArchive { .. } => "PatchedFromArchive",
            DirectiveKind::TransformedTexture { .. } => "TransformedTexture",
            DirectiveKind::CreateBsa { .. } => "CreateBSA",
            DirectiveKind::InlineFile { .. } => "InlineFile",
            DirectiveKind::RemappedInlineFile { .. } => "RemappedInlineFile",
            DirectiveKind::MergedPatch { .. } => "MergedPatch",
            DirectiveKind::NoMatch { .. } => "NoMatch",
            DirectiveKind::IgnoredDirectly { .. } => "IgnoredDirectly",
            DirectiveKind::Unknown { type_name, .. } => type_name,
        }
    }

    /// Whether replaying this directive must reproduce exactly [`hash`](Self::hash).
    ///
    /// Re-encoded textures and path-remapped files legitimately differ from the
    /// bytes seen at compile time; for those only size and readability are checked.
    pub fn is_deterministic(&self) -> bool {
        !matches!(
            self.kind,
            DirectiveKind::TransformedTexture { .. }
                | DirectiveKind::RemappedInlineFile { .. }
                | DirectiveKind::Unknown { .. }
        )
    }

    /// Compile-time outcomes that never appear in a finished recipe.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            DirectiveKind::NoMatch { .. } | DirectiveKind::IgnoredDirectly { .. }
        )
    }

    pub fn archive_hash_path(&self) -> Option<&HashPath> {
        match &self.kind {
            DirectiveKind::FromArchive { archive_hash_path }
            | DirectiveKind::PatchedFromArchive {
                archive_hash_path, ..
            }
            | DirectiveKind::TransformedTexture {
                archive_hash_path, ..
            } => Some(archive_hash_path),
            _ => None,
        }
    }

    /// Ids of package data entries this directive reads.
    pub fn data_ids(&self) -> Vec<&str> {
        match &self.kind {
            DirectiveKind::PatchedFromArchive { patch_id, .. }
            | DirectiveKind::MergedPatch { patch_id, .. } => vec![patch_id],
            DirectiveKind::InlineFile { source_data_id }
            | DirectiveKind::RemappedInlineFile { source_data_id } => vec![source_data_id],
            _ => Vec::new(),
        }
    }
}

#[derive(Serialize)]
struct DirectiveOut<'a> {
    to: &'a RelativePath,
    hash: Hash,
    size: u64,
    #[serde(flatten)]
    kind: &'a DirectiveKind,
}

#[derive(Deserialize)]
struct DirectiveIn {
    to: RelativePath,
    hash: Hash,
    #[serde(default)]
    size: u64,
    #[serde(flatten)]
    kind: DirectiveKind,
}

#[derive(Deserialize)]
struct DirectiveHeader {
    to: RelativePath,
    hash: Hash,
    #[serde(default)]
    size: u64,
}

impl Serialize for Directive {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.kind {
            DirectiveKind::Unknown { raw, .. } => raw.serialize(serializer),
            kind => DirectiveOut {
                to: &self.to,
                hash: self.hash,
                size: self.size,
                kind,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Directive {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let type_name = value
            .get("$type")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::missing_field("$type"))?
            .to_string();

        if KNOWN_TYPES.contains(&type_name.as_str()) {
            let parsed: DirectiveIn = serde_json::from_value(value).map_err(D::Error::custom)?;
            return Ok(Directive::new(parsed.to, parsed.hash, parsed.size, parsed.kind));
        }

        let header: DirectiveHeader = serde_json::from_value(value.clone()).map_err(D::Error::custom)?;
        Ok(Directive::new(
            header.to,
            header.hash,
            header.size,
            DirectiveKind::Unknown {
                type_name,
                raw: value,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    #[test]
    fn test_from_archive_json_shape() {
        let directive = Directive::new(
            rel("Data/texture.dds"),
            Hash(0x1234),
            4,
            DirectiveKind::FromArchive {
                archive_hash_path: HashPath::new(Hash(0xabcd)).join(rel("textures/texture.dds")),
            },
        );
        let json = serde_json::to_value(&directive).unwrap();

        assert_eq!(json["$type"], "FromArchive");
        assert_eq!(json["to"], "Data/texture.dds");
        assert_eq!(json["hash"], "0000000000001234");
        assert_eq!(json["archiveHashPath"]["parts"][0], "textures/texture.dds");

        let back: Directive = serde_json::from_value(json).unwrap();
        assert_eq!(back, directive);
    }

    #[test]
    fn test_create_bsa_tag_and_fields() {
        let directive = Directive::new(
            rel("Data/Textures.bsa"),
            Hash(9),
            100,
            DirectiveKind::CreateBsa {
                temp_id: "0".to_string(),
                state: ContainerState {
                    format: "zip".to_string(),
                    options: Value::Null,
                },
                file_states: vec![],
            },
        );
        let json = serde_json::to_value(&directive).unwrap();
        assert_eq!(json["$type"], "CreateBSA");
        assert_eq!(json["tempId"], "0");
        assert!(json.get("fileStates").is_some());
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let raw = serde_json::json!({
            "$type": "FromTheFuture",
            "to": "Data/new.bin",
            "hash": "00000000000000ff",
            "size": 7,
            "futureField": [1, 2, 3]
        });
        let directive: Directive = serde_json::from_value(raw.clone()).unwrap();

        assert_eq!(directive.type_name(), "FromTheFuture");
        assert_eq!(directive.to, rel("Data/new.bin"));
        assert!(!directive.is_deterministic());
        assert_eq!(serde_json::to_value(&directive).unwrap(), raw);
    }

    #[test]
    fn test_missing_type_is_an_error() {
        let raw = serde_json::json!({"to": "a", "hash": "0000000000000001"});
        assert!(serde_json::from_value::<Directive>(raw).is_err());
    }

    #[test]
    fn test_classification() {
        let texture = Directive::new(
            rel("t.dds"),
            Hash(1),
            1,
            DirectiveKind::TransformedTexture {
                archive_hash_path: HashPath::new(Hash(2)),
                image_state: ImageState {
                    width: 4,
                    height: 4,
                    mip_levels: 1,
                    format: "BC1".to_string(),
                    perceptual_hash: vec![],
                },
            },
        );
        assert!(!texture.is_deterministic());
        assert_eq!(texture.archive_hash_path(), Some(&HashPath::new(Hash(2))));

        let no_match = Directive::new(
            rel("x"),
            Hash(1),
            1,
            DirectiveKind::NoMatch {
                reason: "no match".to_string(),
            },
        );
        assert!(no_match.is_terminal());

        let inline = Directive::new(
            rel("y"),
            Hash(3),
            1,
            DirectiveKind::InlineFile {
                source_data_id: inline_data_id(Hash(3)),
            },
        );
        assert!(inline.is_deterministic());
        assert_eq!(inline.data_ids(), vec!["inline-0000000000000003"]);
    }
}
