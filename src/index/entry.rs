//! Archive entry records.

use super::SparseMap;
use crate::archive_path;
use crate::ownership::Ownership;
use crate::timestamp::Timestamp;

/// File type bit mask of a Unix mode.
pub const S_IFMT: u32 = 0o170_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;

/// Mode of directories the index creates on its own.
pub const SYNTHETIC_DIR_MODE: u32 = S_IFDIR | 0o755;

/// What an entry is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file (device nodes and fifos are reported as empty files).
    File,
    /// A directory.
    Directory,
    /// A symbolic link. The target is kept verbatim and never followed.
    Symlink {
        /// Link target as recorded in the archive.
        target: String,
    },
    /// A hard link to another path of the same archive.
    HardLink {
        /// Normalized path of the link target.
        target: String,
    },
    /// An OCI whiteout: hides earlier versions of this path.
    Deleted,
}

impl EntryKind {
    /// Stable name used in persisted indexes.
    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink { .. } => "symlink",
            EntryKind::HardLink { .. } => "hardlink",
            EntryKind::Deleted => "deleted",
        }
    }

    /// Rebuilds a kind from [`name`](Self::name) and the stored link target.
    pub fn from_name(name: &str, link_target: Option<String>) -> Option<Self> {
        Some(match name {
            "file" => EntryKind::File,
            "dir" => EntryKind::Directory,
            "symlink" => EntryKind::Symlink {
                target: link_target.unwrap_or_default(),
            },
            "hardlink" => EntryKind::HardLink {
                target: link_target?,
            },
            "deleted" => EntryKind::Deleted,
            _ => return None,
        })
    }
}

/// One version of one path in an archive.
///
/// Entries are produced by index builders and never change afterwards. A
/// path that appears again in the archive gets a new entry with a higher
/// `occurrence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Normalized path; the root is the empty string.
    pub path: String,
    /// Entry type.
    pub kind: EntryKind,
    /// Content length in bytes. Zero for directories and links.
    pub size: u64,
    /// Unix mode including the file type bits.
    pub mode: u32,
    /// Owner and group.
    pub ownership: Ownership,
    /// Modification time.
    pub mtime: Timestamp,
    /// Decoded-stream offset of the content.
    pub content_offset: u64,
    /// Decoded-stream offset of the record header.
    pub header_offset: u64,
    /// Which mounted source produced this entry.
    pub source_id: u32,
    /// Position in scan order.
    pub occurrence: u64,
    /// True for directories the index created to connect the tree.
    pub synthetic: bool,
    /// Data layout of a sparse file; `size` is then the restored length.
    pub sparse: Option<SparseMap>,
}

impl Entry {
    /// A directory the index creates for a missing ancestor.
    pub fn synthetic_dir(path: impl Into<String>, mtime: Timestamp, occurrence: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
            mode: SYNTHETIC_DIR_MODE,
            ownership: Ownership::default(),
            mtime,
            content_offset: 0,
            header_offset: 0,
            source_id: 0,
            occurrence,
            synthetic: true,
            sparse: None,
        }
    }

    /// The root directory of an index.
    pub fn root() -> Self {
        Self::synthetic_dir("", Timestamp::EPOCH, 0)
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        archive_path::split_parent(&self.path).map_or("", |(_, name)| name)
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Returns true for regular files.
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Returns true for symbolic links.
    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink { .. })
    }

    /// Returns true for hard links.
    pub fn is_hardlink(&self) -> bool {
        matches!(self.kind, EntryKind::HardLink { .. })
    }

    /// Returns true for whiteouts.
    pub fn is_deleted(&self) -> bool {
        self.kind == EntryKind::Deleted
    }

    /// Target of a symbolic or hard link.
    pub fn link_target(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Symlink { target } | EntryKind::HardLink { target } => Some(target),
            _ => None,
        }
    }

    /// Permission bits without the file type.
    pub fn permissions(&self) -> u32 {
        self.mode & !S_IFMT
    }

    /// A copy of this entry presented as a directory at `path`.
    ///
    /// Used for archive files that are mounted in place.
    pub fn as_mount_point(&self) -> Self {
        // Directories need search permission wherever they can be read.
        let readable = self.permissions() & 0o444;
        Self {
            kind: EntryKind::Directory,
            size: 0,
            mode: S_IFDIR | (self.permissions() & 0o7777) | (readable >> 2),
            ..self.clone()
        }
    }
}
