//! # seekstone
//!
//! Read-only, randomly addressable file trees over tar archives, compressed
//! tarballs, single compressed files, zip archives and plain directories.
//!
//! Archives and most compressors are sequential: reaching byte N normally
//! means decoding bytes 0..N. seekstone makes one pass over an archive to
//! build a seek index (paths, metadata, content offsets and codec
//! checkpoints), optionally persists it next to the archive, and then serves
//! `read(path, offset, length)` by resuming decoding at the nearest
//! checkpoint before `offset`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use seekstone::{MountConfig, MountContext, MountSource, Result};
//!
//! fn main() -> Result<()> {
//!     let ctx = MountContext::new(MountConfig::default())?;
//!     let archive = ctx.open_archive("backup.tar.gz")?;
//!
//!     for name in archive.list_children("etc")? {
//!         println!("etc/{name}");
//!     }
//!
//!     let entry = archive.stat("etc/hostname")?;
//!     let bytes = archive.read_file("etc/hostname", 0, entry.size as usize)?;
//!     println!("{}", String::from_utf8_lossy(&bytes));
//!     Ok(())
//! }
//! ```
//!
//! ### Several Roots and Nested Archives
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use seekstone::{MountConfig, MountContext, MountSource, Precedence, Result};
//!
//! fn main() -> Result<()> {
//!     let config = MountConfig::new()
//!         .recursive(true)
//!         .union_precedence(Precedence::LaterWins);
//!     let ctx = Arc::new(MountContext::new(config)?);
//!
//!     // Layers are unioned; `patch.tar` shadows `base.tar.zst`.
//!     let tree = ctx.open_mount(&["base.tar.zst", "patch.tar"])?;
//!
//!     // Archives inside the tree show up as directories.
//!     let data = tree.read_file("vendor/libs.tar.gz/lib/a.so", 0, 4096)?;
//!     println!("{} bytes", data.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `gzip` | Yes | gzip streams and deflated zip entries |
//! | `bzip2` | Yes | bzip2 streams |
//! | `xz` | Yes | xz streams (sequential access only) |
//! | `zstd` | Yes | Zstandard streams |
//! | `parallel` | Yes | Block-parallel decoding and decode-ahead scans with Rayon |
//! | `regex` | No | Regex-based path rewriting while indexing |
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade and installs no logger. Index
//! builds and loads are reported at `info`, checkpoint insertion, decoder
//! reuse and nested-archive downgrades at `debug`, best-effort mounts at
//! `warn`.
//!
//! ## Minimum Supported Rust Version (MSRV)
//!
//! This crate requires **Rust 1.85** or later.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

/// Default buffer size for decode and copy loops (64 KiB).
pub(crate) const READ_BUFFER_SIZE: usize = 64 * 1024;

pub mod archive_path;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod detect;
pub mod error;
pub mod index;
pub mod io;
pub mod mount;
pub mod ownership;
pub mod parallel;
pub mod reader;
pub mod tar;
pub mod timestamp;

mod singleflight;

pub use archive_path::ArchivePath;
pub use error::{Error, Result};
pub use ownership::Ownership;
pub use timestamp::Timestamp;

pub use config::{IndexLocation, IndexOptions, MountConfig, PathTransform, Precedence, Threads};

pub use checkpoint::{Checkpoint, CheckpointList, CodecState};
pub use codec::{Codec, CodecKind, StreamDecoder};
pub use io::{ByteSource, FileSource, MemorySource, SliceSource};

pub use parallel::{BlockParallelDecoder, CancellationToken};
pub use reader::{CheckpointedReader, DecoderPool, PoolStats};

pub use detect::ArchiveFormat;
pub use index::store::{ArchiveIdentity, IndexStore};
pub use index::{Entry, EntryKind, Index};
pub use tar::{BuildFailure, BuiltIndex, IndexBuilder};

pub use mount::{
    AutoMountLayer, CompressedFileSource, EntryReader, FolderSource, ForeignArchive, ForeignEntry,
    ForeignSource, LeafSource, MountContext, MountSource, SourceInfo, SquashfsArchive, TarSource,
    UnionSource, ZipArchive,
};
