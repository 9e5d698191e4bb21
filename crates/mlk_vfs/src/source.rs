//! Byte sources: where the bytes of a root file or an extracted entry live.

use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::{CancellationToken, ContentHasher, Hash};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};

/// Entries up to this size are extracted into memory; larger ones go to a temp file.
pub const DEFAULT_SPILL_THRESHOLD: u64 = 64 * 1024 * 1024;

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Forward-only stream of a file's bytes, as returned by
/// [`Context::resolve`](crate::Context::resolve).
pub type ByteStream = Box<dyn Read + Send>;

/// Random-access byte source that can be reopened any number of times.
///
/// Cloning is cheap. Temporary files are deleted when the last clone (and every
/// reader opened from it) has been dropped.
#[derive(Clone, Debug)]
pub enum ByteSource {
    File(Utf8PathBuf),
    Memory(Arc<[u8]>),
    Temp(Arc<TempPath>),
}

impl ByteSource {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ByteSource::Memory(Arc::from(bytes.into().into_boxed_slice()))
    }

    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        ByteSource::File(path.into())
    }

    /// Extract `reader` into a new source, hashing on the way.
    ///
    /// `size_hint` decides between memory and a temporary file.
    pub fn spill<R: Read>(
        mut reader: R,
        size_hint: u64,
        threshold: u64,
        token: &CancellationToken,
    ) -> Result<(ByteSource, Hash)> {
        let mut writer = SpillWriter::new(size_hint, threshold, token)?;
        writer.copy_from(&mut reader)?;
        writer.finish()
    }

    pub fn len(&self) -> Result<u64> {
        match self {
            ByteSource::File(path) => std::fs::metadata(path.as_std_path())
                .map(|m| m.len())
                .map_err(|source| io_fault(path, source)),
            ByteSource::Memory(bytes) => Ok(bytes.len() as u64),
            ByteSource::Temp(path) => Ok(std::fs::metadata(&**path)?.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Open an independent seekable reader.
    pub fn open(&self) -> Result<Box<dyn ReadSeek>> {
        match self {
            ByteSource::File(path) => {
                let file = File::open(path.as_std_path()).map_err(|source| io_fault(path, source))?;
                Ok(Box::new(BufReader::new(file)))
            }
            ByteSource::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            ByteSource::Temp(path) => Ok(Box::new(TempReader {
                file: BufReader::new(File::open(&**path)?),
                _guard: path.clone(),
            })),
        }
    }

    /// Open an independent forward-only stream.
    pub fn stream(&self) -> Result<ByteStream> {
        match self {
            ByteSource::File(path) => {
                let file = File::open(path.as_std_path()).map_err(|source| io_fault(path, source))?;
                Ok(Box::new(BufReader::new(file)))
            }
            ByteSource::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            ByteSource::Temp(path) => Ok(Box::new(TempReader {
                file: BufReader::new(File::open(&**path)?),
                _guard: path.clone(),
            })),
        }
    }

    /// Human-readable origin for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            ByteSource::File(path) => path.to_string(),
            ByteSource::Memory(bytes) => format!("<memory, {} bytes>", bytes.len()),
            ByteSource::Temp(path) => path.display().to_string(),
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        match self {
            ByteSource::Memory(bytes) => Ok(bytes.to_vec()),
            _ => {
                let mut buf = Vec::with_capacity(self.len()? as usize);
                self.open()?.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }

    /// Up to `len` leading bytes, for format sniffing.
    pub fn header(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len);
        self.open()?.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn hash(&self, token: &CancellationToken) -> Result<Hash> {
        match self {
            ByteSource::Memory(bytes) => {
                token.check()?;
                Ok(Hash::of(bytes))
            }
            _ => Ok(mlk_core::hash_reader(self.open()?, token, None)?),
        }
    }

    /// Filesystem path backing this source, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            ByteSource::File(path) => Some(path.as_std_path()),
            ByteSource::Temp(path) => {
                let path: &std::path::Path = path;
                Some(path)
            }
            ByteSource::Memory(_) => None,
        }
    }
}

pub(crate) fn io_fault(path: &Utf8Path, source: io::Error) -> Error {
    Error::IoFault {
        path: path.to_path_buf(),
        source,
    }
}

/// Sink that hashes everything written to it and keeps it in memory until it
/// outgrows the spill threshold, then moves it to a temporary file.
///
/// Each write checks the cancellation token.
pub struct SpillWriter<'a> {
    target: SpillTarget,
    hasher: ContentHasher,
    threshold: u64,
    written: u64,
    token: &'a CancellationToken,
}

enum SpillTarget {
    Memory(Vec<u8>),
    Temp(BufWriter<NamedTempFile>),
}

impl<'a> SpillWriter<'a> {
    pub fn new(size_hint: u64, threshold: u64, token: &'a CancellationToken) -> Result<Self> {
        let target = if size_hint > threshold {
            SpillTarget::Temp(BufWriter::new(NamedTempFile::new()?))
        } else {
            SpillTarget::Memory(Vec::with_capacity(size_hint as usize))
        };
        Ok(Self {
            target,
            hasher: ContentHasher::new(),
            threshold,
            written: 0,
            token,
        })
    }

    /// Copy all of `reader` into this sink.
    pub fn copy_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<u64> {
        match io::copy(reader, self) {
            Ok(n) => Ok(n),
            Err(_) if self.token.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    pub fn finish(self) -> Result<(ByteSource, Hash)> {
        self.token.check()?;
        let hash = self.hasher.finish();
        let source = match self.target {
            SpillTarget::Memory(buf) => ByteSource::from_bytes(buf),
            SpillTarget::Temp(writer) => {
                let temp = writer.into_inner().map_err(|e| e.into_error())?;
                ByteSource::Temp(Arc::new(temp.into_temp_path()))
            }
        };
        Ok((source, hash))
    }

    fn move_to_temp(&mut self) -> io::Result<()> {
        if let SpillTarget::Memory(buf) = &mut self.target {
            let mut temp = BufWriter::new(NamedTempFile::new()?);
            temp.write_all(buf)?;
            self.target = SpillTarget::Temp(temp);
        }
        Ok(())
    }
}

impl Write for SpillWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(io::Error::other("cancelled"));
        }
        if self.written + buf.len() as u64 > self.threshold {
            self.move_to_temp()?;
        }
        let n = match &mut self.target {
            SpillTarget::Memory(v) => {
                v.extend_from_slice(buf);
                buf.len()
            }
            SpillTarget::Temp(w) => w.write(buf)?,
        };
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.target {
            SpillTarget::Memory(_) => Ok(()),
            SpillTarget::Temp(w) => w.flush(),
        }
    }
}

/// Reader that keeps its temporary file alive.
struct TempReader {
    file: BufReader<File>,
    _guard: Arc<TempPath>,
}

impl Read for TempReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for TempReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
