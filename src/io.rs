//! Positional byte sources.
//!
//! Every archive is read through a [`ByteSource`]: a length plus a
//! `read_at` that does not move any shared cursor, so one source can serve
//! any number of concurrent decoders. Sources exist for real files, for
//! in-memory buffers, for sub-ranges of other sources and (in
//! [`mount`](crate::mount)) for file entries of another mounted tree.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Random-access, read-only bytes.
pub trait ByteSource: Send + Sync + fmt::Debug {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset`.
    ///
    /// Returns 0 at or past the end.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Returns true if the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fills `buf` completely from `offset`.
    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(offset, buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "source ended before the requested range",
                    ));
                }
                Ok(n) => {
                    offset += n as u64;
                    buf = &mut buf[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads up to `len` bytes at `offset` into a new buffer.
    fn read_vec_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let available = self.len().saturating_sub(offset).min(len as u64) as usize;
        let mut buf = vec![0u8; available];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

/// A file on disk.
pub struct FileSource {
    path: PathBuf,
    file: File,
    len: u64,
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl FileSource {
    /// Opens a file for positional reads.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self { path, file, len })
    }

    /// The path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;

        if offset >= self.len {
            return Ok(0);
        }
        let max = (self.len - offset).min(buf.len() as u64) as usize;
        self.file.read_at(&mut buf[..max], offset)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;

        if offset >= self.len {
            return Ok(0);
        }
        let max = (self.len - offset).min(buf.len() as u64) as usize;
        self.file.seek_read(&mut buf[..max], offset)
    }
}

/// Bytes held in memory.
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("len", &self.data.len())
            .finish()
    }
}

impl MemorySource {
    /// Wraps a buffer.
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        let Some(rest) = self.data.get(start..) else {
            return Ok(0);
        };
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        Ok(n)
    }
}

/// A window `[start, start + len)` of another source.
#[derive(Debug, Clone)]
pub struct SliceSource {
    inner: Arc<dyn ByteSource>,
    start: u64,
    len: u64,
}

impl SliceSource {
    /// Creates a window, clamped to the inner source's length.
    pub fn new(inner: Arc<dyn ByteSource>, start: u64, len: u64) -> Self {
        let len = len.min(inner.len().saturating_sub(start));
        Self { inner, start, len }
    }
}

impl ByteSource for SliceSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let max = (self.len - offset).min(buf.len() as u64) as usize;
        self.inner.read_at(self.start + offset, &mut buf[..max])
    }
}

/// A `Read + Seek` cursor over a [`ByteSource`].
#[derive(Debug, Clone)]
pub struct SourceReader {
    source: Arc<dyn ByteSource>,
    pos: u64,
}

impl SourceReader {
    /// Creates a reader positioned at `pos`.
    pub fn new(source: Arc<dyn ByteSource>, pos: u64) -> Self {
        Self { source, pos }
    }

    /// Current position.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SourceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.source.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            )),
        }
    }
}

/// A buffered reader that counts the bytes its consumer has taken.
///
/// Decoders that stop exactly at the end of a gzip member or a zstd frame
/// consume precisely the bytes of that member through `BufRead`; the count
/// is then the member's compressed end offset.
pub struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R> fmt::Debug for CountingReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingReader")
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

impl<R: BufRead> CountingReader<R> {
    /// Wraps a buffered reader. `start` is the offset of its first byte.
    pub fn new(inner: R, start: u64) -> Self {
        Self {
            inner,
            consumed: start,
        }
    }

    /// Offset just past the last consumed byte.
    pub fn offset(&self) -> u64 {
        self.consumed
    }

    /// Returns true if no unconsumed input remains.
    pub fn at_eof(&mut self) -> io::Result<bool> {
        Ok(self.inner.fill_buf()?.is_empty())
    }

    /// Returns true if the unconsumed input starts with `magic`.
    ///
    /// Only the currently buffered bytes are inspected; callers should use a
    /// buffer larger than any magic they test.
    pub fn starts_with(&mut self, magic: &[u8]) -> io::Result<bool> {
        let buf = self.inner.fill_buf()?;
        Ok(buf.len() >= magic.len() && &buf[..magic.len()] == magic)
    }
}

impl<R: BufRead> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.consumed += amt as u64;
        self.inner.consume(amt);
    }
}
