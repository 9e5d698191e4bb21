//! Bundled zip support.
//!
//! [`ZipReader`] implements both [`ArchiveReader`] (so zips in the download pool are
//! expanded during indexing) and [`ContainerCodec`] (so an installed zip can be
//! rebuilt from its members). Rebuilding records the original entry name, storage
//! method, timestamp and permissions per member; entries using any other storage
//! method cannot be rebuilt.

use crate::archive::{
    ArchiveReader, ContainerCodec, ContainerState, EntryHandle, MemberState, WriteSeek,
};
use crate::error::{Error, Result};
use crate::source::{ByteSource, ByteStream, ReadSeek, SpillWriter, DEFAULT_SPILL_THRESHOLD};
use mlk_core::{CancellationToken, RelativePath};
use serde::{Deserialize, Serialize};
use std::io;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

const LOCAL_HEADER_MAGIC: &[u8] = b"PK\x03\x04";
const EMPTY_ARCHIVE_MAGIC: &[u8] = b"PK\x05\x06";

/// Zip archive reader and rebuilder.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipReader;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZipContainerOptions {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    comment: String,
    /// Directory entries as `(index, raw name)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    directories: Vec<(usize, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZipEntryOptions {
    /// Entry name exactly as stored.
    name: String,
    compression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modified: Option<[u16; 6]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unix_mode: Option<u32>,
}

fn open_archive(source: &ByteSource) -> Result<ZipArchive<Box<dyn ReadSeek>>> {
    ZipArchive::new(source.open()?).map_err(|e| Error::corrupt(source.describe(), e))
}

fn compression_name(method: CompressionMethod) -> String {
    match method {
        CompressionMethod::Stored => "stored".to_string(),
        CompressionMethod::Deflated => "deflated".to_string(),
        other => format!("{:?}", other).to_ascii_lowercase(),
    }
}

impl ArchiveReader for ZipReader {
    fn name(&self) -> &str {
        "zip"
    }

    fn can_read(&self, header: &[u8], _name: &str) -> bool {
        header.starts_with(LOCAL_HEADER_MAGIC) || header.starts_with(EMPTY_ARCHIVE_MAGIC)
    }

    fn list_entries(&self, source: &ByteSource) -> Result<Vec<EntryHandle>> {
        let mut archive = open_archive(source)?;
        let mut entries = Vec::with_capacity(archive.len());

        for index in 0..archive.len() {
            let file = archive
                .by_index(index)
                .map_err(|e| Error::corrupt(source.describe(), e))?;
            if file.is_dir() {
                continue;
            }
            match RelativePath::new(file.name()) {
                Ok(path) => entries.push(EntryHandle {
                    index,
                    path,
                    size: file.size(),
                }),
                Err(e) => {
                    tracing::warn!("Skipping zip entry '{}' in {}: {}", file.name(), source.describe(), e);
                }
            }
        }

        Ok(entries)
    }

    fn open_entry(&self, source: &ByteSource, entry: &EntryHandle) -> Result<ByteStream> {
        let token = CancellationToken::new();
        let mut sink = SpillWriter::new(entry.size, DEFAULT_SPILL_THRESHOLD, &token)?;
        self.extract_entry(source, entry, &mut sink)?;
        let (extracted, _) = sink.finish()?;
        extracted.stream()
    }

    fn extract_entry(
        &self,
        source: &ByteSource,
        entry: &EntryHandle,
        sink: &mut SpillWriter<'_>,
    ) -> Result<u64> {
        let mut archive = open_archive(source)?;
        let mut file = archive
            .by_index(entry.index)
            .map_err(|e| Error::corrupt(source.describe(), e))?;
        sink.copy_from(&mut file)
    }
}

impl ContainerCodec for ZipReader {
    fn format(&self) -> &str {
        "zip"
    }

    fn can_read(&self, header: &[u8], name: &str) -> bool {
        ArchiveReader::can_read(self, header, name)
    }

    fn read_state(&self, source: &ByteSource) -> Result<(ContainerState, Vec<MemberState>)> {
        let mut archive = open_archive(source)?;
        let mut container = ZipContainerOptions {
            comment: String::from_utf8_lossy(archive.comment()).into_owned(),
            directories: Vec::new(),
        };
        let mut members = Vec::new();

        for index in 0..archive.len() {
            let file = archive
                .by_index(index)
                .map_err(|e| Error::corrupt(source.describe(), e))?;
            if file.is_dir() {
                container.directories.push((index, file.name().to_string()));
                continue;
            }

            let options = ZipEntryOptions {
                name: file.name().to_string(),
                compression: compression_name(file.compression()),
                modified: file.last_modified().map(|t| {
                    [
                        t.year(),
                        t.month() as u16,
                        t.day() as u16,
                        t.hour() as u16,
                        t.minute() as u16,
                        t.second() as u16,
                    ]
                }),
                unix_mode: file.unix_mode(),
            };
            let path = RelativePath::new(file.name())
                .map_err(|e| Error::corrupt(source.describe(), e))?;

            members.push(MemberState {
                index,
                path,
                options: serde_json::to_value(options)?,
            });
        }

        let state = ContainerState {
            format: ContainerCodec::format(self).to_string(),
            options: serde_json::to_value(container)?,
        };
        Ok((state, members))
    }

    fn build(
        &self,
        state: &ContainerState,
        members: &[(MemberState, ByteSource)],
        out: &mut dyn WriteSeek,
    ) -> Result<()> {
        let container: ZipContainerOptions = if state.options.is_null() {
            ZipContainerOptions::default()
        } else {
            serde_json::from_value(state.options.clone())?
        };

        let mut writer = ZipWriter::new(out);
        if !container.comment.is_empty() {
            writer.set_comment(container.comment.clone());
        }

        let mut directories = container.directories.iter().peekable();
        for (member, source) in members {
            while let Some((_, name)) = directories.next_if(|(index, _)| *index < member.index) {
                writer.add_directory(name.as_str(), SimpleFileOptions::default())?;
            }

            let options: ZipEntryOptions = serde_json::from_value(member.options.clone())?;
            writer.start_file(options.name.as_str(), file_options(&options)?)?;
            io::copy(&mut source.open()?, &mut writer)?;
        }
        for (_, name) in directories {
            writer.add_directory(name.as_str(), SimpleFileOptions::default())?;
        }

        writer.finish()?;
        Ok(())
    }
}

fn file_options(entry: &ZipEntryOptions) -> Result<SimpleFileOptions> {
    let method = match entry.compression.as_str() {
        "stored" => CompressionMethod::Stored,
        "deflated" => CompressionMethod::Deflated,
        other => return Err(Error::UnsupportedFormat(format!("zip/{}", other))),
    };

    let mut options = SimpleFileOptions::default().compression_method(method);
    if let Some([year, month, day, hour, minute, second]) = entry.modified {
        let time = DateTime::from_date_and_time(
            year,
            month as u8,
            day as u8,
            hour as u8,
            minute as u8,
            second as u8,
        )
        .map_err(|_| Error::corrupt(entry.name.clone(), "invalid entry timestamp"))?;
        options = options.last_modified_time(time);
    }
    // 0o644 is the writer's default; only override unusual modes.
    if let Some(mode) = entry.unix_mode.filter(|m| m & 0o777 != 0o644) {
        options = options.unix_permissions(mode);
    }
    Ok(options)
}
