//! Fetching archives the installer does not have yet.
//!
//! Download protocols live outside this crate. A [`Downloader`] is handed an
//! [`ArchiveDescriptor`] (whose `state` it interprets) and a destination path,
//! and reports the content hash of what it wrote. The installer checks that hash
//! against the descriptor.

use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::fs::stage_in;
use mlk_core::{copy_hashed, ByteProgressCallback, CancellationToken, Hash};
use mlk_recipe::ArchiveDescriptor;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use thiserror::Error;

/// `"$type"` of download states served by [`LocalMirrorDownloader`].
pub const LOCAL_MIRROR_STATE: &str = "LocalMirror";

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{0}' is not available from this source")]
    NotFound(String),

    #[error("No downloader handles '{0}' states")]
    Unsupported(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl From<mlk_core::Error> for DownloadError {
    fn from(e: mlk_core::Error) -> Self {
        match e {
            mlk_core::Error::Cancelled => DownloadError::Cancelled,
            mlk_core::Error::Io(io) => DownloadError::Io(io),
            other => DownloadError::Failed(other.to_string()),
        }
    }
}

/// Download collaborator.
pub trait Downloader: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether this downloader understands `archive.state`.
    fn can_download(&self, archive: &ArchiveDescriptor) -> bool;

    /// Write the archive to `destination` and return the hash of what was written.
    ///
    /// Nothing may be left at `destination` on failure.
    fn fetch(
        &self,
        archive: &ArchiveDescriptor,
        destination: &Utf8Path,
        progress: Option<&ByteProgressCallback>,
        token: &CancellationToken,
    ) -> Result<Hash, DownloadError>;
}

/// Serves archives from local directories, looking them up by file name.
///
/// Handles `LocalMirror` states and, as a fallback, any archive whose file
/// name exists in one of the mirror directories.
#[derive(Debug, Clone)]
pub struct LocalMirrorDownloader {
    dirs: Vec<Utf8PathBuf>,
}

impl LocalMirrorDownloader {
    pub fn new(dirs: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    fn locate(&self, archive: &ArchiveDescriptor) -> Option<Utf8PathBuf> {
        let name = archive
            .state
            .get("fileName")
            .and_then(|v| v.as_str())
            .unwrap_or(&archive.name);
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }
}

impl Downloader for LocalMirrorDownloader {
    fn name(&self) -> &str {
        "local-mirror"
    }

    fn can_download(&self, archive: &ArchiveDescriptor) -> bool {
        archive.state_type() == Some(LOCAL_MIRROR_STATE) || self.locate(archive).is_some()
    }

    fn fetch(
        &self,
        archive: &ArchiveDescriptor,
        destination: &Utf8Path,
        progress: Option<&ByteProgressCallback>,
        token: &CancellationToken,
    ) -> Result<Hash, DownloadError> {
        let source = self
            .locate(archive)
            .ok_or_else(|| DownloadError::NotFound(archive.name.clone()))?;
        tracing::debug!("Copying {} from mirror {}", archive.name, source);

        let input = BufReader::new(File::open(source.as_std_path())?);
        let staged = stage_in(destination)?;
        let mut output = BufWriter::new(staged);
        let (_, hash) = copy_hashed(input, &mut output, token, progress, archive.size)?;
        output.flush()?;
        let staged = output.into_inner().map_err(|e| e.into_error())?;
        staged
            .persist(destination.as_std_path())
            .map_err(|e| DownloadError::Io(e.error))?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, bytes: &[u8]) -> ArchiveDescriptor {
        ArchiveDescriptor {
            name: name.to_string(),
            hash: Hash::of(bytes),
            size: bytes.len() as u64,
            state: serde_json::json!({"$type": LOCAL_MIRROR_STATE}),
            meta: None,
        }
    }

    #[test]
    fn test_mirror_copies_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("mirror")).unwrap();
        std::fs::write(root.join("mirror/a.zip"), b"archive bytes").unwrap();

        let mirror = LocalMirrorDownloader::new([root.join("mirror")]);
        let archive = descriptor("a.zip", b"archive bytes");
        assert!(mirror.can_download(&archive));

        let dest = root.join("downloads/a.zip");
        let hash = mirror
            .fetch(&archive, &dest, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(hash, archive.hash);
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive bytes");
    }

    #[test]
    fn test_mirror_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mirror = LocalMirrorDownloader::new([root.clone()]);

        let result = mirror.fetch(
            &descriptor("gone.zip", b"x"),
            &root.join("out/gone.zip"),
            None,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(DownloadError::NotFound(_))));
        assert!(!root.join("out/gone.zip").exists());
    }

    #[test]
    fn test_cancelled_fetch_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("a.zip"), vec![7u8; 4096]).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let dest = root.join("downloads/a.zip");
        let result = LocalMirrorDownloader::new([root.clone()]).fetch(
            &descriptor("a.zip", &[7u8; 4096]),
            &dest,
            None,
            &token,
        );
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(!dest.exists());
    }
}
