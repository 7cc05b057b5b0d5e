//! A single compressed file that is not an archive.

use std::collections::BTreeSet;

use super::{MountSource, clamp_read, index_content, index_list, index_read_link, index_stat, index_versions};
use crate::archive_path;
use crate::index::{Entry, Index};
use crate::reader::CheckpointedReader;
use crate::{Error, Result};

/// Exposes `data.csv.gz` as a root holding one file, `data.csv`.
///
/// The file is the whole decoded stream; reads go through a
/// [`CheckpointedReader`] like tar content does.
#[derive(Debug)]
pub struct CompressedFileSource {
    name: String,
    index: Index,
    reader: CheckpointedReader,
}

impl CompressedFileSource {
    /// Wraps a one-entry index built by
    /// [`IndexBuilder::scan_raw`](crate::IndexBuilder::scan_raw).
    pub fn new(index: Index, reader: CheckpointedReader) -> Self {
        let name = index
            .recorded_entries()
            .first()
            .map(|entry| entry.path.clone())
            .unwrap_or_default();
        Self {
            name,
            index,
            reader,
        }
    }

    /// Path of the decoded file.
    pub fn file_name(&self) -> &str {
        &self.name
    }

    /// The reader over the decoded stream.
    pub fn reader(&self) -> &CheckpointedReader {
        &self.reader
    }
}

impl MountSource for CompressedFileSource {
    fn list_children(&self, path: &str) -> Result<BTreeSet<String>> {
        index_list(&self.index, &archive_path::normalize(path))
    }

    fn stat(&self, path: &str) -> Result<Entry> {
        index_stat(&self.index, &archive_path::normalize(path))
    }

    fn read_file(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let path = archive_path::normalize(path);
        let content = index_content(&self.index, &path)?;
        let want = clamp_read(content.size, offset, len);
        if want == 0 {
            return Ok(Vec::new());
        }
        let data = self.reader.read(offset, want)?;
        if data.len() < want {
            return Err(Error::truncated(
                offset + data.len() as u64,
                "decoded stream is shorter than when it was indexed",
            ));
        }
        Ok(data)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        index_read_link(&self.index, &archive_path::normalize(path))
    }

    fn versions(&self, path: &str) -> Result<Vec<Entry>> {
        index_versions(&self.index, &archive_path::normalize(path))
    }
}
