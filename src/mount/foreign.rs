//! Archives whose format is handled by a separate backend.
//!
//! A [`ForeignArchive`] lists its entries once and extracts byte ranges on
//! demand; [`ForeignSource`] builds the usual path index over the listing.
//! The crate ships ZIP and SquashFS backends,
//! [`ZipArchive`](super::ZipArchive) and
//! [`SquashfsArchive`](super::SquashfsArchive).

use std::collections::BTreeSet;
use std::fmt;

use log::info;

use super::{MountSource, clamp_read, index_content, index_list, index_read_link, index_stat, index_versions};
use crate::archive_path;
use crate::index::{Entry, EntryKind, Index, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::ownership::Ownership;
use crate::timestamp::Timestamp;
use crate::{Error, Result};

/// One entry reported by a [`ForeignArchive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignEntry {
    /// Path inside the archive, as stored.
    pub path: String,
    /// Entry type.
    pub kind: EntryKind,
    /// Uncompressed size.
    pub size: u64,
    /// Permission bits, with or without file type bits.
    pub mode: u32,
    /// Modification time.
    pub mtime: Timestamp,
    /// Owner and group.
    pub ownership: Ownership,
    /// Backend-specific handle passed back to [`ForeignArchive::extract`].
    pub locator: u64,
}

/// A backend that can list and extract one archive format.
pub trait ForeignArchive: Send + Sync + fmt::Debug {
    /// Human-readable name of the format.
    fn format_name(&self) -> &'static str;

    /// Every entry in archive order.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the archive's directory is unreadable.
    fn list(&self) -> Result<Vec<ForeignEntry>>;

    /// Up to `len` bytes of `entry`'s contents starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFormat`] for entries the backend cannot
    /// decode (encryption, unknown methods) and corruption errors for bad data.
    fn extract(&self, entry: &ForeignEntry, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// A mounted [`ForeignArchive`].
#[derive(Debug)]
pub struct ForeignSource {
    archive: Box<dyn ForeignArchive>,
    index: Index,
    entries: Vec<ForeignEntry>,
}

impl ForeignSource {
    /// Lists `archive` and indexes its entries under `source_id`.
    ///
    /// # Errors
    ///
    /// Returns the backend's listing error.
    pub fn new(archive: Box<dyn ForeignArchive>, source_id: u32) -> Result<Self> {
        let entries = archive.list()?;
        let mut index = Index::new();
        for (occurrence, foreign) in entries.iter().enumerate() {
            let path = archive_path::normalize(&foreign.path);
            if path.is_empty() {
                continue;
            }
            let type_bits = match foreign.kind {
                EntryKind::Directory => S_IFDIR,
                EntryKind::Symlink { .. } => S_IFLNK,
                _ => S_IFREG,
            };
            index.insert(Entry {
                path,
                kind: foreign.kind.clone(),
                size: foreign.size,
                mode: type_bits | (foreign.mode & !S_IFMT),
                ownership: foreign.ownership.clone(),
                mtime: foreign.mtime,
                content_offset: foreign.locator,
                header_offset: foreign.locator,
                source_id,
                occurrence: occurrence as u64,
                synthetic: false,
                sparse: None,
            });
        }
        info!(
            "listed {} {} entries",
            index.len(),
            archive.format_name()
        );
        Ok(Self {
            archive,
            index,
            entries,
        })
    }

    /// Name of the backend's format.
    pub fn format_name(&self) -> &'static str {
        self.archive.format_name()
    }
}

impl MountSource for ForeignSource {
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
        let foreign = usize::try_from(content.occurrence)
            .ok()
            .and_then(|i| self.entries.get(i))
            .ok_or_else(|| Error::not_found(path.as_str()))?;
        self.archive.extract(foreign, offset, want)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        index_read_link(&self.index, &archive_path::normalize(path))
    }

    fn versions(&self, path: &str) -> Result<Vec<Entry>> {
        index_versions(&self.index, &archive_path::normalize(path))
    }
}
