//! Mounted file trees.
//!
//! Every mounted archive, folder or composition of them is a [`MountSource`]:
//! a read-only tree addressed by `/`-separated paths relative to its root.
//! Paths are normalized on the way in, so `"/a/./b/"` and `"a/b"` name the
//! same entry.
//!
//! # Source Kinds
//!
//! | Type | Serves |
//! |------|--------|
//! | [`TarSource`] | tar archives, plain or compressed |
//! | [`CompressedFileSource`] | a single compressed file that is not a container |
//! | [`ForeignSource`] | archives read through a [`ForeignArchive`] backend: [`ZipArchive`] or [`SquashfsArchive`] |
//! | [`FolderSource`] | a real directory |
//! | [`AutoMountLayer`] | archives nested inside another source |
//! | [`UnionSource`] | several sources overlaid on each other |
//!
//! Leaf sources are opened through a [`MountContext`], which owns the
//! index store and the shared decoder.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::io::Read;
//! use std::sync::Arc;
//! use seekstone::{EntryReader, MountConfig, MountContext, MountSource};
//!
//! let ctx = MountContext::new(MountConfig::default())?;
//! let source = ctx.open_archive("logs.tar.gz")?;
//!
//! let mut text = String::new();
//! EntryReader::open(source, "var/log/syslog")?.read_to_string(&mut text)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod auto;
mod compressed;
mod context;
mod folder;
pub mod foreign;
mod squashfs;
mod tar_source;
mod union;
mod zip;

pub use auto::AutoMountLayer;
pub use compressed::CompressedFileSource;
pub use context::{MountContext, SourceInfo};
pub use folder::FolderSource;
pub use foreign::{ForeignArchive, ForeignEntry, ForeignSource};
pub use squashfs::SquashfsArchive;
pub use tar_source::TarSource;
pub use union::UnionSource;
pub use zip::ZipArchive;

use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::index::{Entry, EntryKind, Index};
use crate::io::ByteSource;
use crate::{Error, Result};

/// A read-only file tree.
///
/// Implementations are shared between threads; every operation takes
/// `&self` and leaves the tree unchanged.
pub trait MountSource: Send + Sync + fmt::Debug {
    /// Names of the entries directly inside the directory `path`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `path` does not exist, [`Error::NotADirectory`]
    /// if it is not a directory.
    fn list_children(&self, path: &str) -> Result<BTreeSet<String>>;

    /// Metadata of the current version of `path`.
    ///
    /// Symbolic links are reported as links, never followed. A hard link
    /// keeps its kind and reports the size of the data it shares.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `path` does not exist.
    fn stat(&self, path: &str) -> Result<Entry>;

    /// Up to `len` bytes of the file at `path`, starting at `offset`.
    ///
    /// Reads past the end of the file return fewer bytes (or none). Hard
    /// links are resolved to the data they share.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `path` does not exist, [`Error::NotAFile`] if
    /// it is a directory or a symbolic link.
    fn read_file(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// The target of the symbolic link at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `path` does not exist, [`Error::NotASymlink`]
    /// if it is something else.
    fn read_link(&self, path: &str) -> Result<String>;

    /// Every visible version of `path`, oldest first.
    ///
    /// Sources that keep no history report only the current version.
    fn versions(&self, path: &str) -> Result<Vec<Entry>> {
        Ok(vec![self.stat(path)?])
    }

    /// Returns true if `path` exists.
    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    /// Number of versions of `path`; 0 if it does not exist.
    fn file_versions(&self, path: &str) -> usize {
        self.versions(path).map_or(0, |versions| versions.len())
    }
}

/// The closed set of sources a [`MountContext`] opens.
#[derive(Debug)]
pub enum LeafSource {
    /// A tar archive.
    Tar(TarSource),
    /// A single compressed file.
    Compressed(CompressedFileSource),
    /// An archive read through a foreign backend.
    Foreign(ForeignSource),
    /// A directory on disk.
    Folder(FolderSource),
}

impl LeafSource {
    fn inner(&self) -> &dyn MountSource {
        match self {
            LeafSource::Tar(source) => source,
            LeafSource::Compressed(source) => source,
            LeafSource::Foreign(source) => source,
            LeafSource::Folder(source) => source,
        }
    }

    /// Short name of the source kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LeafSource::Tar(_) => "tar",
            LeafSource::Compressed(_) => "compressed",
            LeafSource::Foreign(source) => source.format_name(),
            LeafSource::Folder(_) => "folder",
        }
    }
}

impl MountSource for LeafSource {
    fn list_children(&self, path: &str) -> Result<BTreeSet<String>> {
        self.inner().list_children(path)
    }

    fn stat(&self, path: &str) -> Result<Entry> {
        self.inner().stat(path)
    }

    fn read_file(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.inner().read_file(path, offset, len)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        self.inner().read_link(path)
    }

    fn versions(&self, path: &str) -> Result<Vec<Entry>> {
        self.inner().versions(path)
    }
}

// Lookups shared by the index-backed sources.

pub(crate) fn index_stat(index: &Index, path: &str) -> Result<Entry> {
    let entry = index.current(path).ok_or_else(|| Error::not_found(path))?;
    if entry.is_hardlink() {
        if let Some(target) = index.resolve_hardlink(&entry) {
            return Ok(Entry {
                size: target.size,
                ..Entry::clone(&entry)
            });
        }
    }
    Ok(Entry::clone(&entry))
}

pub(crate) fn index_list(index: &Index, path: &str) -> Result<BTreeSet<String>> {
    let entry = index.current(path).ok_or_else(|| Error::not_found(path))?;
    if !entry.is_dir() {
        return Err(Error::NotADirectory {
            path: path.to_string(),
        });
    }
    Ok(index.list_children(path).unwrap_or_default())
}

pub(crate) fn index_read_link(index: &Index, path: &str) -> Result<String> {
    let entry = index.current(path).ok_or_else(|| Error::not_found(path))?;
    match &entry.kind {
        EntryKind::Symlink { target } => Ok(target.clone()),
        _ => Err(Error::NotASymlink {
            path: path.to_string(),
        }),
    }
}

pub(crate) fn index_versions(index: &Index, path: &str) -> Result<Vec<Entry>> {
    if index.current(path).is_none() {
        return Err(Error::not_found(path));
    }
    Ok(index
        .versions(path)
        .iter()
        .filter(|entry| !entry.is_deleted())
        .map(|entry| Entry::clone(entry))
        .collect())
}

/// The entry holding the bytes of the file at `path`.
pub(crate) fn index_content(index: &Index, path: &str) -> Result<Arc<Entry>> {
    let entry = index.current(path).ok_or_else(|| Error::not_found(path))?;
    let content = index
        .resolve_hardlink(&entry)
        .ok_or_else(|| Error::not_found(entry.link_target().unwrap_or(path)))?;
    if !content.is_file() {
        return Err(Error::NotAFile {
            path: path.to_string(),
        });
    }
    Ok(content)
}

/// Clamps a read of `len` bytes at `offset` to a file of `size` bytes.
pub(crate) fn clamp_read(size: u64, offset: u64, len: usize) -> usize {
    size.saturating_sub(offset).min(len as u64) as usize
}

/// A `Read + Seek` cursor over one file of a [`MountSource`].
///
/// Each `read` is one [`MountSource::read_file`] call, so wrapping the
/// reader in a [`std::io::BufReader`] is worthwhile for small reads.
pub struct EntryReader {
    source: Arc<dyn MountSource>,
    path: String,
    size: u64,
    pos: u64,
}

impl fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryReader")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}

impl EntryReader {
    /// Opens the file at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `path` does not exist, [`Error::NotAFile`] if
    /// it is a directory or a symbolic link.
    pub fn open(source: Arc<dyn MountSource>, path: &str) -> Result<Self> {
        let entry = source.stat(path)?;
        if entry.is_dir() || entry.is_symlink() {
            return Err(Error::NotAFile {
                path: path.to_string(),
            });
        }
        Ok(Self {
            source,
            path: path.to_string(),
            size: entry.size,
            pos: 0,
        })
    }

    /// Size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = clamp_read(self.size, self.pos, buf.len());
        if want == 0 {
            return Ok(0);
        }
        let data = self.source.read_file(&self.path, self.pos, want)?;
        buf[..data.len()].copy_from_slice(&data);
        self.pos += data.len() as u64;
        Ok(data.len())
    }
}

impl Seek for EntryReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of entry")
        })?;
        self.pos = target;
        Ok(target)
    }
}

/// The bytes of one file of a [`MountSource`], as a [`ByteSource`].
///
/// Nested archives are read through this without being extracted.
#[derive(Debug)]
pub(crate) struct EntryByteSource {
    source: Arc<dyn MountSource>,
    path: String,
    len: u64,
}

impl EntryByteSource {
    pub(crate) fn open(source: Arc<dyn MountSource>, path: &str) -> Result<Self> {
        let len = source.stat(path)?.size;
        Ok(Self {
            source,
            path: path.to_string(),
            len,
        })
    }
}

impl ByteSource for EntryByteSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let want = clamp_read(self.len, offset, buf.len());
        if want == 0 {
            return Ok(0);
        }
        let data = self.source.read_file(&self.path, offset, want)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{S_IFDIR, S_IFLNK, S_IFREG};
    use crate::timestamp::Timestamp;

    fn entry(path: &str, kind: EntryKind, size: u64, occurrence: u64) -> Entry {
        let mode = match kind {
            EntryKind::Directory => S_IFDIR | 0o755,
            EntryKind::Symlink { .. } => S_IFLNK | 0o777,
            _ => S_IFREG | 0o644,
        };
        Entry {
            path: path.to_string(),
            kind,
            size,
            mode,
            ownership: Default::default(),
            mtime: Timestamp::from_unix_secs(1_700_000_000),
            content_offset: 0,
            header_offset: 0,
            source_id: 0,
            occurrence,
            synthetic: false,
            sparse: None,
        }
    }

    fn sample() -> Index {
        let mut index = Index::new();
        index.insert(entry("a", EntryKind::Directory, 0, 0));
        index.insert(entry("a/f1", EntryKind::File, 42, 1));
        index.insert(entry(
            "a/link",
            EntryKind::Symlink {
                target: "f1".into(),
            },
            0,
            2,
        ));
        index.insert(entry(
            "hard",
            EntryKind::HardLink {
                target: "a/f1".into(),
            },
            0,
            3,
        ));
        index.insert(entry(
            "dangling",
            EntryKind::HardLink {
                target: "missing".into(),
            },
            0,
            4,
        ));
        index
    }

    #[test]
    fn test_index_lookup_errors() {
        let index = sample();
        assert!(matches!(
            index_stat(&index, "nope"),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            index_list(&index, "a/f1"),
            Err(Error::NotADirectory { .. })
        ));
        assert!(matches!(
            index_read_link(&index, "a/f1"),
            Err(Error::NotASymlink { .. })
        ));
        assert!(matches!(
            index_content(&index, "a"),
            Err(Error::NotAFile { .. })
        ));
        assert!(matches!(
            index_content(&index, "a/link"),
            Err(Error::NotAFile { .. })
        ));
        assert!(matches!(
            index_content(&index, "dangling"),
            Err(Error::NotFound { path }) if path == "missing"
        ));
    }

    #[test]
    fn test_hardlink_stat_reports_shared_size() {
        let index = sample();
        let hard = index_stat(&index, "hard").unwrap();
        assert!(hard.is_hardlink());
        assert_eq!(hard.size, 42);
        assert_eq!(index_content(&index, "hard").unwrap().path, "a/f1");
    }

    #[test]
    fn test_clamp_read() {
        assert_eq!(clamp_read(10, 0, 4), 4);
        assert_eq!(clamp_read(10, 8, 4), 2);
        assert_eq!(clamp_read(10, 10, 4), 0);
        assert_eq!(clamp_read(10, 99, 4), 0);
    }
}
