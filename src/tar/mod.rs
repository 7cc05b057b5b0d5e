//! Tar archive indexing.
//!
//! [`IndexBuilder`] makes one sequential pass over a decoded tar stream and
//! records every entry's metadata and content offset, plus codec checkpoints
//! for later random access. Supported dialects are v7, POSIX ustar (with the
//! `prefix` field), GNU (long name and long link records, base-256 numbers,
//! sparse files) and PAX (per-entry and global extended headers, including
//! the `GNU.sparse` map formats 0.0, 0.1 and 1.0).

mod builder;
mod header;
mod sparse;

pub use builder::{BuildFailure, BuiltIndex, IndexBuilder};
pub use header::{BLOCK_SIZE, looks_like_header};
