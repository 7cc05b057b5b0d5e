//! Error types for archive indexing and random access.
//!
//! This module provides the [`Error`] enum which represents all possible
//! failure modes when mounting and reading archives, along with a convenient
//! [`Result<T>`] type alias.
//!
//! # Error Handling
//!
//! Lookup errors ([`Error::NotFound`], [`Error::NotAFile`],
//! [`Error::NotADirectory`], [`Error::NotASymlink`]) are ordinary negative
//! answers and surface per call. Build errors ([`Error::CorruptArchive`],
//! [`Error::TruncatedArchive`]) surface once, when a source is opened, and
//! only affect that source.
//!
//! ```rust,no_run
//! use seekstone::{Error, MountConfig, MountContext, MountSource};
//!
//! fn cat(archive: &str, path: &str) -> seekstone::Result<Vec<u8>> {
//!     let ctx = MountContext::new(MountConfig::default())?;
//!     let source = ctx.open_archive(archive)?;
//!     match source.stat(path) {
//!         Ok(entry) => source.read_file(path, 0, entry.size as usize),
//!         Err(Error::NotFound { .. }) => Ok(Vec::new()),
//!         Err(e) => Err(e),
//!     }
//! }
//! ```
//!
//! ## Filesystem Adapters
//!
//! `Error` converts into [`std::io::Error`] with the kind a filesystem adapter
//! needs to pick an errno:
//!
//! ```rust
//! use seekstone::Error;
//! use std::io;
//!
//! let err: io::Error = Error::NotFound { path: "a/b".into() }.into();
//! assert_eq!(err.kind(), io::ErrorKind::NotFound);
//! ```

use std::io;

/// The error type for archive indexing and access operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred while reading an archive or an index file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested path does not exist in the mounted tree.
    ///
    /// This is a normal negative lookup and is never logged as a failure.
    #[error("no such entry: {path}")]
    NotFound {
        /// The path that was looked up.
        path: String,
    },

    /// A file operation was attempted on a directory.
    #[error("not a file: {path}")]
    NotAFile {
        /// The path that was looked up.
        path: String,
    },

    /// A directory operation was attempted on something else.
    #[error("not a directory: {path}")]
    NotADirectory {
        /// The path that was looked up.
        path: String,
    },

    /// A link target was requested for something that is not a symlink.
    #[error("not a symbolic link: {path}")]
    NotASymlink {
        /// The path that was looked up.
        path: String,
    },

    /// The container or the codec detected invalid data.
    ///
    /// Fatal for the source it was raised for. A partial index, if the
    /// builder produced one, may still be mounted when
    /// [`MountConfig::best_effort`](crate::MountConfig::best_effort) is set.
    #[error("corrupt archive at offset {offset:#x}: {reason}")]
    CorruptArchive {
        /// Offset in the decoded stream (or the raw file for foreign formats).
        offset: u64,
        /// Description of the corruption.
        reason: String,
    },

    /// The stream ended before a record or a compressed frame was complete.
    #[error("truncated archive at offset {offset:#x}: {reason}")]
    TruncatedArchive {
        /// Offset at which more data was expected.
        offset: u64,
        /// What was being read when the stream ended.
        reason: String,
    },

    /// A persisted index no longer matches its archive.
    ///
    /// Never surfaced by mounting: the index is rebuilt instead.
    #[error("stale index: {0}")]
    StaleIndex(String),

    /// The data is not in a format this build can mount.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A path inside an archive could not be represented.
    #[error("invalid archive path: {0}")]
    InvalidArchivePath(String),

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The index database could not be read or written.
    #[error("index database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The index database exists but its contents are unusable.
    #[error("invalid index: {0}")]
    InvalidIndex(String),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns `true` for ordinary negative lookups.
    ///
    /// These are the errors a union source skips over while searching for a
    /// path in lower-precedence members.
    pub fn is_lookup_miss(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::NotADirectory { .. } | Error::NotAFile { .. }
        )
    }

    /// Returns `true` if this is a data corruption or truncation error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptArchive { .. } | Error::TruncatedArchive { .. }
        )
    }

    /// Returns the `errno` value a filesystem adapter should report.
    pub fn raw_os_error_hint(&self) -> i32 {
        match self {
            Error::NotFound { .. } => 2,       // ENOENT
            Error::NotAFile { .. } => 21,      // EISDIR
            Error::NotADirectory { .. } => 20, // ENOTDIR
            Error::NotASymlink { .. } | Error::InvalidArchivePath(_) | Error::InvalidConfig(_) => {
                22 // EINVAL
            }
            Error::Io(e) => e.raw_os_error().unwrap_or(5),
            Error::Cancelled => 4, // EINTR
            _ => 5,                // EIO
        }
    }

    /// Creates a not-found error for a path.
    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound { path: path.into() }
    }

    /// Creates a corruption error.
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptArchive {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a truncation error.
    pub(crate) fn truncated(offset: u64, reason: impl Into<String>) -> Self {
        Error::TruncatedArchive {
            offset,
            reason: reason.into(),
        }
    }

    /// Classifies an I/O error raised while decoding at `offset`.
    ///
    /// Errors that originated as an [`Error`] (for example a read through a
    /// parent mount source) are unwrapped again instead of being re-labelled.
    pub(crate) fn from_decode(err: io::Error, offset: u64) -> Self {
        let kind = err.kind();
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(inner) = inner.downcast::<Error>() {
                    return *inner;
                }
            }
            return Error::corrupt(offset, "decoder failure");
        }
        match kind {
            io::ErrorKind::UnexpectedEof => Error::truncated(offset, err.to_string()),
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::Other => {
                Error::corrupt(offset, err.to_string())
            }
            _ => Error::Io(err),
        }
    }

    /// Produces an owned copy of this error for every waiter of a shared build.
    ///
    /// Sources that are not `Clone` (I/O and database errors) are re-created
    /// from their kind and message.
    pub(crate) fn share(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::NotFound { path } => Error::NotFound { path: path.clone() },
            Error::NotAFile { path } => Error::NotAFile { path: path.clone() },
            Error::NotADirectory { path } => Error::NotADirectory { path: path.clone() },
            Error::NotASymlink { path } => Error::NotASymlink { path: path.clone() },
            Error::CorruptArchive { offset, reason } => Error::corrupt(*offset, reason.clone()),
            Error::TruncatedArchive { offset, reason } => Error::truncated(*offset, reason.clone()),
            Error::StaleIndex(s) => Error::StaleIndex(s.clone()),
            Error::UnsupportedFormat(s) => Error::UnsupportedFormat(s.clone()),
            Error::InvalidArchivePath(s) => Error::InvalidArchivePath(s.clone()),
            Error::InvalidConfig(s) => Error::InvalidConfig(s.clone()),
            Error::Database(e) => Error::InvalidIndex(e.to_string()),
            Error::InvalidIndex(s) => Error::InvalidIndex(s.clone()),
            Error::Cancelled => Error::Cancelled,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(e) => e.kind(),
            Error::NotFound { .. } => io::ErrorKind::NotFound,
            Error::NotAFile { .. } => io::ErrorKind::IsADirectory,
            Error::NotADirectory { .. } => io::ErrorKind::NotADirectory,
            Error::NotASymlink { .. }
            | Error::InvalidArchivePath(_)
            | Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            Error::TruncatedArchive { .. } => io::ErrorKind::UnexpectedEof,
            Error::CorruptArchive { .. } | Error::InvalidIndex(_) => io::ErrorKind::InvalidData,
            Error::UnsupportedFormat(_) => io::ErrorKind::Unsupported,
            Error::Cancelled => io::ErrorKind::Interrupted,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// A specialized Result type for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corrupt(0x200, "header checksum mismatch");
        assert_eq!(
            err.to_string(),
            "corrupt archive at offset 0x200: header checksum mismatch"
        );

        let err = Error::not_found("a/b");
        assert_eq!(err.to_string(), "no such entry: a/b");
    }

    #[test]
    fn test_io_kind_mapping() {
        let cases = [
            (Error::not_found("x"), io::ErrorKind::NotFound),
            (
                Error::NotAFile { path: "d".into() },
                io::ErrorKind::IsADirectory,
            ),
            (
                Error::NotADirectory { path: "f".into() },
                io::ErrorKind::NotADirectory,
            ),
            (
                Error::NotASymlink { path: "f".into() },
                io::ErrorKind::InvalidInput,
            ),
            (Error::truncated(10, "eof"), io::ErrorKind::UnexpectedEof),
            (Error::corrupt(10, "bad"), io::ErrorKind::InvalidData),
        ];
        for (err, kind) in cases {
            let io_err: io::Error = err.into();
            assert_eq!(io_err.kind(), kind);
        }
    }

    #[test]
    fn test_raw_os_error_hint() {
        assert_eq!(Error::not_found("x").raw_os_error_hint(), 2);
        assert_eq!(Error::NotAFile { path: "d".into() }.raw_os_error_hint(), 21);
        assert_eq!(Error::NotADirectory { path: "f".into() }.raw_os_error_hint(), 20);
        assert_eq!(Error::corrupt(0, "bad").raw_os_error_hint(), 5);
    }

    #[test]
    fn test_from_decode_round_trips_wrapped_errors() {
        let io_err: io::Error = Error::not_found("inner").into();
        let back = Error::from_decode(io_err, 0);
        assert!(matches!(back, Error::NotFound { path } if path == "inner"));
    }

    #[test]
    fn test_from_decode_classifies_plain_io() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short");
        assert!(matches!(
            Error::from_decode(eof, 7),
            Error::TruncatedArchive { offset: 7, .. }
        ));

        let bad = io::Error::new(io::ErrorKind::InvalidData, "bad block");
        assert!(Error::from_decode(bad, 7).is_corruption());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(Error::from_decode(denied, 7), Error::Io(_)));
    }

    #[test]
    fn test_classification() {
        assert!(Error::not_found("x").is_lookup_miss());
        assert!(!Error::not_found("x").is_corruption());
        assert!(Error::truncated(0, "eof").is_corruption());
        assert!(!Error::Cancelled.is_lookup_miss());
    }

    #[test]
    fn test_share_preserves_variant() {
        let err = Error::corrupt(4, "bad");
        assert!(matches!(
            err.share(),
            Error::CorruptArchive { offset: 4, .. }
        ));
        let err = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        match err.share() {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("unexpected {other:?}"),
        }
    }
}
