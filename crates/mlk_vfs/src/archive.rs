//! Collaborator contracts for archive formats and image handling.
//!
//! The VFS never parses container internals itself. It sniffs each source with the
//! registered [`ArchiveReader`]s and, if one claims it, asks that reader for the
//! entry table and for one entry stream at a time.
//!
//! Two further contracts are used by the compiler and installer:
//!
//! - [`ContainerCodec`] describes how to rebuild a container byte-for-byte from its
//!   members (used when a game archive is deconstructed at compile time and
//!   reassembled at install time).
//! - [`ImageAnalyzer`] provides perceptual comparison and re-encoding of textures.

use crate::error::Result;
use crate::source::{ByteSource, ByteStream, SpillWriter};
use mlk_core::RelativePath;
use std::io::{Seek, Write};

/// Bytes read from the start of a source for format detection.
pub const SNIFF_LEN: usize = 512;

/// One entry in a container's table of contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHandle {
    /// Reader-specific position of the entry.
    pub index: usize,
    pub path: RelativePath,
    /// Uncompressed size.
    pub size: u64,
}

/// Read-side archive format collaborator.
pub trait ArchiveReader: Send + Sync {
    /// Short format name used in logs.
    fn name(&self) -> &str;

    /// Whether this reader handles a source with the given leading bytes and name.
    fn can_read(&self, header: &[u8], name: &str) -> bool;

    /// Enumerate file entries (directories excluded), in container order.
    fn list_entries(&self, source: &ByteSource) -> Result<Vec<EntryHandle>>;

    /// Open one entry previously returned by [`list_entries`](Self::list_entries).
    fn open_entry(&self, source: &ByteSource, entry: &EntryHandle) -> Result<ByteStream>;

    /// Stream one entry into `sink`. Readers that can decompress straight into a
    /// writer should override this to skip the intermediate stream.
    fn extract_entry(
        &self,
        source: &ByteSource,
        entry: &EntryHandle,
        sink: &mut SpillWriter<'_>,
    ) -> Result<u64> {
        let mut stream = self.open_entry(source, entry)?;
        sink.copy_from(&mut stream)
    }
}

/// How a container was built, opaque to everything but its codec.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// Codec name, see [`ContainerCodec::format`].
    pub format: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// How one member was stored inside a container.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberState {
    /// Position inside the container.
    pub index: usize,
    pub path: RelativePath,
    #[serde(default)]
    pub options: serde_json::Value,
}

pub trait WriteSeek: Write + Seek {}
impl<T: Write + Seek> WriteSeek for T {}

/// Write-side container format collaborator.
pub trait ContainerCodec: Send + Sync {
    /// Format name recorded in [`ContainerState::format`].
    fn format(&self) -> &str;

    fn can_read(&self, header: &[u8], name: &str) -> bool;

    /// Capture everything needed to rebuild `source`.
    fn read_state(&self, source: &ByteSource) -> Result<(ContainerState, Vec<MemberState>)>;

    /// Assemble a container from member bytes, in `members` order.
    fn build(
        &self,
        state: &ContainerState,
        members: &[(MemberState, ByteSource)],
        out: &mut dyn WriteSeek,
    ) -> Result<()>;
}

/// Decoded properties of a texture.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageState {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    /// Pixel format name as understood by the analyzer.
    pub format: String,
    /// Analyzer-specific perceptual fingerprint.
    #[serde(default)]
    pub perceptual_hash: Vec<u8>,
}

/// Texture analysis and re-encoding collaborator.
pub trait ImageAnalyzer: Send + Sync {
    /// Whether files with this name should be analyzed at all.
    fn can_analyze(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        lower.ends_with(".dds") || lower.ends_with(".tga")
    }

    /// Decode `source`; `Ok(None)` if it is not an image this analyzer understands.
    fn analyze(&self, source: &ByteSource) -> Result<Option<ImageState>>;

    /// Perceptual similarity in `[0.0, 1.0]`.
    fn similarity(&self, a: &ImageState, b: &ImageState) -> f32;

    /// Re-encode `source` to match `target`.
    fn transform(&self, source: &ByteSource, target: &ImageState, out: &mut dyn Write) -> Result<()>;
}
