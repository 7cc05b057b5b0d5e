//! Tar archives served from their index.

use std::collections::BTreeSet;

use super::{MountSource, clamp_read, index_content, index_list, index_read_link, index_stat, index_versions};
use crate::archive_path;
use crate::index::{Entry, Index, SparsePiece};
use crate::parallel::CancellationToken;
use crate::reader::CheckpointedReader;
use crate::{Error, Result};

/// A tar archive: its index plus random access into the decoded stream.
///
/// Metadata operations never touch the archive. A file read maps to one
/// range read of the decoded stream at the entry's content offset; a sparse
/// file needs one read per stored run the range touches, and its holes read
/// as zeros.
#[derive(Debug)]
pub struct TarSource {
    name: String,
    index: Index,
    reader: CheckpointedReader,
}

impl TarSource {
    /// Combines an index with a reader over the stream it was built from.
    pub fn new(name: impl Into<String>, index: Index, reader: CheckpointedReader) -> Self {
        Self {
            name: name.into(),
            index,
            reader,
        }
    }

    /// Name of the archive, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path index.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The reader over the decoded stream.
    pub fn reader(&self) -> &CheckpointedReader {
        &self.reader
    }

    /// Like [`MountSource::read_file`], but gives up with [`Error::Cancelled`]
    /// once `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`MountSource::read_file`], plus [`Error::Cancelled`].
    pub fn read_file_cancellable(
        &self,
        path: &str,
        offset: u64,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let path = archive_path::normalize(path);
        let content = index_content(&self.index, &path)?;
        let want = clamp_read(content.size, offset, len);
        if want == 0 {
            return Ok(Vec::new());
        }
        let Some(sparse) = &content.sparse else {
            return self.read_stored(&path, content.content_offset + offset, want, cancel);
        };

        let mut out = Vec::with_capacity(want);
        for piece in sparse.pieces(offset, want as u64) {
            match piece {
                SparsePiece::Hole { len } => out.resize(out.len() + len as usize, 0),
                SparsePiece::Data { stored, len } => {
                    let start = content.content_offset + stored;
                    out.extend(self.read_stored(&path, start, len as usize, cancel)?);
                }
            }
        }
        Ok(out)
    }

    /// Reads `len` bytes of the decoded stream that must all exist.
    fn read_stored(
        &self,
        path: &str,
        start: u64,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let data = self.reader.read_cancellable(start, len, cancel)?;
        if data.len() < len {
            return Err(Error::truncated(
                start + data.len() as u64,
                format!("content of `{path}` ends early"),
            ));
        }
        Ok(data)
    }
}

impl MountSource for TarSource {
    fn list_children(&self, path: &str) -> Result<BTreeSet<String>> {
        index_list(&self.index, &archive_path::normalize(path))
    }

    fn stat(&self, path: &str) -> Result<Entry> {
        index_stat(&self.index, &archive_path::normalize(path))
    }

    fn read_file(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.read_file_cancellable(path, offset, len, &CancellationToken::new())
    }

    fn read_link(&self, path: &str) -> Result<String> {
        index_read_link(&self.index, &archive_path::normalize(path))
    }

    fn versions(&self, path: &str) -> Result<Vec<Entry>> {
        index_versions(&self.index, &archive_path::normalize(path))
    }
}
