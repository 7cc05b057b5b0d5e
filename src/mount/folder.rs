//! A real directory tree.

use std::collections::BTreeSet;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use super::MountSource;
use crate::archive_path;
use crate::index::{Entry, EntryKind, S_IFDIR, S_IFLNK, S_IFREG};
use crate::io::{ByteSource, FileSource};
use crate::ownership::Ownership;
use crate::timestamp::Timestamp;
use crate::{Error, Result};

/// Serves a directory on disk with the same contract as an archive.
///
/// Symbolic links are reported as links and never followed, so a link can
/// not lead a lookup outside the root.
#[derive(Debug, Clone)]
pub struct FolderSource {
    root: PathBuf,
}

impl FolderSource {
    /// Serves the tree under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotADirectory`] if `root` is not a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let metadata = fs::metadata(root)?;
        if !metadata.is_dir() {
            return Err(Error::NotADirectory {
                path: root.display().to_string(),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// The directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> (String, PathBuf) {
        let path = archive_path::normalize(path);
        let full = if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&path)
        };
        (path, full)
    }

    fn metadata(&self, path: &str, full: &Path) -> Result<Metadata> {
        fs::symlink_metadata(full).map_err(|e| lookup_error(e, path))
    }
}

fn lookup_error(err: io::Error, path: &str) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => Error::not_found(path),
        io::ErrorKind::NotADirectory => Error::NotADirectory {
            path: path.to_string(),
        },
        _ => Error::Io(err),
    }
}

#[cfg(unix)]
fn mode_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;

    metadata.mode()
}

#[cfg(not(unix))]
fn mode_of(metadata: &Metadata) -> u32 {
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        S_IFDIR | 0o755
    } else if file_type.is_symlink() {
        S_IFLNK | 0o777
    } else if metadata.permissions().readonly() {
        S_IFREG | 0o444
    } else {
        S_IFREG | 0o644
    }
}

impl MountSource for FolderSource {
    fn list_children(&self, path: &str) -> Result<BTreeSet<String>> {
        let (path, full) = self.resolve(path);
        if !self.metadata(&path, &full)?.is_dir() {
            return Err(Error::NotADirectory { path });
        }
        let mut names = BTreeSet::new();
        for dirent in fs::read_dir(&full)? {
            names.insert(dirent?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn stat(&self, path: &str) -> Result<Entry> {
        let (path, full) = self.resolve(path);
        let metadata = self.metadata(&path, &full)?;
        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink {
                target: fs::read_link(&full)?.to_string_lossy().into_owned(),
            }
        } else {
            EntryKind::File
        };
        let type_bits = match kind {
            EntryKind::Directory => S_IFDIR,
            EntryKind::Symlink { .. } => S_IFLNK,
            _ => S_IFREG,
        };
        Ok(Entry {
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
            mode: type_bits | (mode_of(&metadata) & 0o7777),
            ownership: Ownership::from_metadata(&metadata),
            mtime: metadata
                .modified()
                .map(Timestamp::from)
                .unwrap_or(Timestamp::EPOCH),
            content_offset: 0,
            header_offset: 0,
            source_id: 0,
            occurrence: 0,
            synthetic: false,
            sparse: None,
            path,
            kind,
        })
    }

    fn read_file(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let (path, full) = self.resolve(path);
        let metadata = self.metadata(&path, &full)?;
        if metadata.is_dir() || metadata.file_type().is_symlink() {
            return Err(Error::NotAFile { path });
        }
        let file = FileSource::open(&full).map_err(|e| lookup_error(e, &path))?;
        Ok(file.read_vec_at(offset, len)?)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let (path, full) = self.resolve(path);
        if !self.metadata(&path, &full)?.file_type().is_symlink() {
            return Err(Error::NotASymlink { path });
        }
        Ok(fs::read_link(&full)?.to_string_lossy().into_owned())
    }
}
