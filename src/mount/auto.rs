//! Archives nested inside other sources.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use super::{EntryByteSource, MountContext, MountSource, SourceInfo};
use crate::archive_path;
use crate::detect::{self, ArchiveFormat};
use crate::index::Entry;
use crate::singleflight::SingleFlight;
use crate::{Error, Result};

/// What a nested archive file turned out to be.
#[derive(Debug)]
enum Nested {
    Mounted(Arc<AutoMountLayer>),
    /// Not mountable; served as a plain file.
    Opaque,
}

/// Where a path lands after crossing archive boundaries.
enum Route {
    /// Served by the wrapped source.
    Inner(String),
    /// The archive file itself, shown as a directory.
    MountPoint(Entry, Arc<AutoMountLayer>),
    /// Inside a nested archive.
    Nested {
        prefix: String,
        rest: String,
        layer: Arc<AutoMountLayer>,
    },
}

/// Presents archive files inside a source as directories.
///
/// Paths pass through to the wrapped source until they cross a regular file
/// recognized as an archive. That file is opened on first access (its bytes
/// are read through the wrapped source, never extracted), wrapped in another
/// layer, and the rest of the path is looked up inside it. A file that turns
/// out not to be a mountable archive stays a plain file.
///
/// Nested archives are opened at most once per `(path, size, mtime)`, even
/// under concurrent first access. I/O failures while opening are returned to
/// the caller and not remembered, so a later access tries again.
#[derive(Debug)]
pub struct AutoMountLayer {
    inner: Arc<dyn MountSource>,
    ctx: Arc<MountContext>,
    depth: usize,
    nested: SingleFlight<(String, u64, i64), Nested>,
}

impl AutoMountLayer {
    /// Wraps `inner`, opening nested archives with `ctx`.
    pub fn new(inner: Arc<dyn MountSource>, ctx: Arc<MountContext>) -> Self {
        Self::at_depth(inner, ctx, 0)
    }

    fn at_depth(inner: Arc<dyn MountSource>, ctx: Arc<MountContext>, depth: usize) -> Self {
        Self {
            inner,
            ctx,
            depth,
            nested: SingleFlight::memoizing(),
        }
    }

    /// How many archive boundaries lie above this layer.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn may_descend(&self) -> bool {
        self.ctx
            .config()
            .max_recursion_depth
            .is_none_or(|max| self.depth < max)
    }

    fn is_candidate(&self, name: &str) -> bool {
        self.ctx.config().detect_by_content
            || detect::detect_extension(name) != ArchiveFormat::Unknown
    }

    fn route(&self, path: &str) -> Result<Route> {
        let path = archive_path::normalize(path);
        if !self.may_descend() || path.is_empty() {
            return Ok(Route::Inner(path));
        }

        let mut boundaries: Vec<usize> = path.match_indices('/').map(|(i, _)| i).collect();
        boundaries.push(path.len());
        for end in boundaries {
            let prefix = &path[..end];
            let name = prefix.rsplit('/').next().unwrap_or(prefix);
            if !self.is_candidate(name) {
                continue;
            }
            let entry = match self.inner.stat(prefix) {
                Ok(entry) => entry,
                Err(e) if e.is_lookup_miss() => return Ok(Route::Inner(path)),
                Err(e) => return Err(e),
            };
            if entry.is_dir() {
                continue;
            }
            if !(entry.is_file() || entry.is_hardlink()) {
                return Ok(Route::Inner(path));
            }
            let Nested::Mounted(layer) = &*self.nested_at(prefix, &entry)? else {
                return Ok(Route::Inner(path));
            };
            let layer = Arc::clone(layer);
            if end == path.len() {
                return Ok(Route::MountPoint(entry.as_mount_point(), layer));
            }
            return Ok(Route::Nested {
                prefix: prefix.to_string(),
                rest: path[end + 1..].to_string(),
                layer,
            });
        }
        Ok(Route::Inner(path))
    }

    fn nested_at(&self, path: &str, entry: &Entry) -> Result<Arc<Nested>> {
        let key = (path.to_string(), entry.size, entry.mtime.as_unix_nanos());
        self.nested.run(key, || self.open_nested(path, entry))
    }

    fn open_nested(&self, path: &str, entry: &Entry) -> Result<Nested> {
        let opened = EntryByteSource::open(Arc::clone(&self.inner), path).and_then(|bytes| {
            let info = SourceInfo {
                name: entry.name().to_string(),
                identity: None,
                mtime: entry.mtime,
                ownership: entry.ownership.clone(),
            };
            self.ctx.open_source(Arc::new(bytes), info)
        });
        match opened {
            Ok(leaf) => {
                debug!(
                    "mounted nested {} archive {path} at depth {}",
                    leaf.kind_name(),
                    self.depth + 1
                );
                Ok(Nested::Mounted(Arc::new(Self::at_depth(
                    Arc::new(leaf),
                    Arc::clone(&self.ctx),
                    self.depth + 1,
                ))))
            }
            Err(e) if is_not_mountable(&e) => {
                debug!("serving {path} as a plain file: {e}");
                Ok(Nested::Opaque)
            }
            Err(e) => Err(e),
        }
    }
}

/// Errors that say something about the file's contents rather than about
/// reading it.
fn is_not_mountable(err: &Error) -> bool {
    err.is_corruption()
        || matches!(
            err,
            Error::UnsupportedFormat(_) | Error::InvalidArchivePath(_)
        )
}

/// Re-anchors a nested lookup error at the outer path.
fn outer_error(err: Error, prefix: &str) -> Error {
    let outer = |path: String| archive_path::join(prefix, &path);
    match err {
        Error::NotFound { path } => Error::NotFound { path: outer(path) },
        Error::NotAFile { path } => Error::NotAFile { path: outer(path) },
        Error::NotADirectory { path } => Error::NotADirectory { path: outer(path) },
        Error::NotASymlink { path } => Error::NotASymlink { path: outer(path) },
        other => other,
    }
}

fn outer_entry(mut entry: Entry, prefix: &str) -> Entry {
    entry.path = archive_path::join(prefix, &entry.path);
    entry
}

impl MountSource for AutoMountLayer {
    fn list_children(&self, path: &str) -> Result<BTreeSet<String>> {
        match self.route(path)? {
            Route::Inner(path) => self.inner.list_children(&path),
            Route::MountPoint(_, layer) => layer.list_children(""),
            Route::Nested {
                prefix,
                rest,
                layer,
            } => layer
                .list_children(&rest)
                .map_err(|e| outer_error(e, &prefix)),
        }
    }

    fn stat(&self, path: &str) -> Result<Entry> {
        match self.route(path)? {
            Route::Inner(path) => self.inner.stat(&path),
            Route::MountPoint(entry, _) => Ok(entry),
            Route::Nested {
                prefix,
                rest,
                layer,
            } => layer
                .stat(&rest)
                .map(|entry| outer_entry(entry, &prefix))
                .map_err(|e| outer_error(e, &prefix)),
        }
    }

    fn read_file(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self.route(path)? {
            Route::Inner(path) => self.inner.read_file(&path, offset, len),
            Route::MountPoint(entry, _) => Err(Error::NotAFile { path: entry.path }),
            Route::Nested {
                prefix,
                rest,
                layer,
            } => layer
                .read_file(&rest, offset, len)
                .map_err(|e| outer_error(e, &prefix)),
        }
    }

    fn read_link(&self, path: &str) -> Result<String> {
        match self.route(path)? {
            Route::Inner(path) => self.inner.read_link(&path),
            Route::MountPoint(entry, _) => Err(Error::NotASymlink { path: entry.path }),
            Route::Nested {
                prefix,
                rest,
                layer,
            } => layer.read_link(&rest).map_err(|e| outer_error(e, &prefix)),
        }
    }

    fn versions(&self, path: &str) -> Result<Vec<Entry>> {
        match self.route(path)? {
            Route::Inner(path) => self.inner.versions(&path),
            Route::MountPoint(entry, _) => Ok(vec![entry]),
            Route::Nested {
                prefix,
                rest,
                layer,
            } => layer
                .versions(&rest)
                .map(|versions| {
                    versions
                        .into_iter()
                        .map(|entry| outer_entry(entry, &prefix))
                        .collect()
                })
                .map_err(|e| outer_error(e, &prefix)),
        }
    }
}
