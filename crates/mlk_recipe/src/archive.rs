use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::fs::stage_in;
use mlk_core::Hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Extension of the download-state sidecar kept next to each archive.
pub const META_EXTENSION: &str = "meta";

/// `<archive>.meta`: where the download state of `archive` is kept.
pub fn meta_path(archive: &Utf8Path) -> Utf8PathBuf {
    let mut name = archive.file_name().unwrap_or_default().to_string();
    name.push('.');
    name.push_str(META_EXTENSION);
    archive.with_file_name(name)
}

/// A downloadable archive the recipe depends on.
///
/// `state` is owned by the download collaborator: a JSON object with a `"$type"`
/// tag naming the source (for example a direct URL or a local mirror) and whatever
/// parameters that source needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveDescriptor {
    pub name: String,
    pub hash: Hash,
    pub size: u64,
    #[serde(default)]
    pub state: Value,
    /// Free-form metadata text shown to users, if the archive came with any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
}

impl ArchiveDescriptor {
    /// The `"$type"` tag of the download state.
    pub fn state_type(&self) -> Option<&str> {
        self.state.get("$type").and_then(Value::as_str)
    }

    /// Write `state` as the sidecar of the archive stored at `archive`,
    /// replacing any sidecar already there. Returns the sidecar path.
    pub fn write_meta(&self, archive: &Utf8Path) -> Result<Utf8PathBuf> {
        if !self.state.is_object() {
            return Err(Error::InvalidRecipe(format!(
                "archive {} has no download state to record",
                self.name
            )));
        }
        let path = meta_path(archive);
        let mut staged = stage_in(&path)?;
        serde_json::to_writer_pretty(&mut staged, &self.state)?;
        staged.persist(path.as_std_path()).map_err(|e| Error::Io(e.error))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_path_appends_extension() {
        assert_eq!(
            meta_path(Utf8Path::new("/dl/SkyUI_5_2.7z")),
            Utf8PathBuf::from("/dl/SkyUI_5_2.7z.meta")
        );
    }

    #[test]
    fn test_write_meta_replaces_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let archive_path = root.join("SkyUI_5_2.zip");
        std::fs::write(meta_path(&archive_path), b"stale").unwrap();

        let mut archive = ArchiveDescriptor {
            name: "SkyUI_5_2.zip".to_string(),
            hash: Hash(1),
            size: 10,
            state: serde_json::json!({"$type": "LocalMirror", "fileName": "SkyUI_5_2.zip"}),
            meta: None,
        };
        let written = archive.write_meta(&archive_path).unwrap();
        let state: Value = serde_json::from_slice(&std::fs::read(&written).unwrap()).unwrap();
        assert_eq!(state, archive.state);

        archive.state = Value::Null;
        assert!(matches!(archive.write_meta(&archive_path), Err(Error::InvalidRecipe(_))));
    }

    #[test]
    fn test_state_type() {
        let archive = ArchiveDescriptor {
            name: "SkyUI_5_2.zip".to_string(),
            hash: Hash(1),
            size: 10,
            state: serde_json::json!({"$type": "HttpDownloader", "url": "https://example.invalid/a.zip"}),
            meta: None,
        };
        assert_eq!(archive.state_type(), Some("HttpDownloader"));

        let json = serde_json::to_value(&archive).unwrap();
        assert!(json.get("meta").is_none());
        assert_eq!(serde_json::from_value::<ArchiveDescriptor>(json).unwrap(), archive);
    }
}
