//! Opening archives and composing mounts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{info, warn};

use super::{
    AutoMountLayer, CompressedFileSource, FolderSource, ForeignSource, LeafSource, MountSource,
    SquashfsArchive, TarSource, UnionSource, ZipArchive,
};
use crate::checkpoint::Checkpoint;
use crate::codec::{self, Codec, CodecKind};
use crate::config::MountConfig;
use crate::detect::{self, ArchiveFormat, SNIFF_LEN};
use crate::index::store::{ArchiveIdentity, IndexLookup, IndexStore, StoreKey};
use crate::io::{ByteSource, FileSource};
use crate::ownership::Ownership;
use crate::parallel::BlockParallelDecoder;
use crate::reader::CheckpointedReader;
use crate::singleflight::SingleFlight;
use crate::tar::{BLOCK_SIZE, BuildFailure, BuiltIndex, IndexBuilder};
use crate::timestamp::Timestamp;
use crate::{Error, READ_BUFFER_SIZE, Result};

/// What is known about a byte stream before it is opened.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// File name, used for extension detection and to name the decoded file
    /// of a single compressed file.
    pub name: String,
    /// Identity of the archive on disk, if it is one. Only archives with an
    /// identity have their index persisted.
    pub identity: Option<ArchiveIdentity>,
    /// Modification time reported for synthesized entries.
    pub mtime: Timestamp,
    /// Ownership reported for synthesized entries.
    pub ownership: Ownership,
}

/// How a tar or compressed stream is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Tar,
    Compressed,
}

impl Layout {
    fn backend(self) -> &'static str {
        match self {
            Layout::Tar => "tar",
            Layout::Compressed => "compressed",
        }
    }
}

/// Shared state for every source opened under one configuration.
///
/// Owns the index store, the block-parallel decoder and the build
/// deduplication table. Concurrent opens of the same archive file scan it
/// once.
///
/// # Example
///
/// ```rust,no_run
/// use seekstone::{MountConfig, MountContext, MountSource};
///
/// let ctx = MountContext::new(MountConfig::default())?;
/// let source = ctx.open_archive("dataset.tar.zst")?;
/// let entry = source.stat("train/0001.json")?;
/// println!("{} bytes", entry.size);
/// # Ok::<(), seekstone::Error>(())
/// ```
#[derive(Debug)]
pub struct MountContext {
    config: MountConfig,
    store: IndexStore,
    decoder: Arc<BlockParallelDecoder>,
    builds: SingleFlight<(PathBuf, u64, i64), LeafSource>,
    next_source_id: AtomicU32,
}

impl MountContext {
    /// Creates a context for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate, or an
    /// I/O error if the decoder threads cannot be started.
    pub fn new(config: MountConfig) -> Result<Self> {
        config.validate()?;
        let decoder = Arc::new(BlockParallelDecoder::new(config.threads)?);
        Ok(Self {
            store: IndexStore::new(config.index.clone()),
            config,
            decoder,
            builds: SingleFlight::new(),
            next_source_id: AtomicU32::new(0),
        })
    }

    /// The configuration sources are opened with.
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// The persisted index store.
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Number of archive streams opened so far, nested ones included.
    pub fn sources_opened(&self) -> u32 {
        self.next_source_id.load(Ordering::SeqCst)
    }

    /// Opens the archive or directory at `path`.
    ///
    /// The format is detected from the file's first bytes, falling back to
    /// its extension. A persisted index is reused when it matches the file;
    /// otherwise the archive is scanned and the new index written.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `path` does not exist,
    /// [`Error::UnsupportedFormat`] for formats without a backend, and the
    /// scan's corruption error unless [`MountConfig::best_effort`] is set.
    pub fn open_archive(&self, path: impl AsRef<Path>) -> Result<Arc<LeafSource>> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::not_found(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        if metadata.is_dir() {
            return Ok(Arc::new(LeafSource::Folder(FolderSource::new(path)?)));
        }

        let canonical = fs::canonicalize(path)?;
        let mtime = metadata
            .modified()
            .map(Timestamp::from)
            .unwrap_or(Timestamp::EPOCH);
        let key = (canonical.clone(), metadata.len(), mtime.as_unix_nanos());
        self.builds.run(key, || {
            if self.config.index.clear_index_cache {
                self.store.clear(&canonical);
            }
            let bytes: Arc<dyn ByteSource> = Arc::new(FileSource::open(&canonical)?);
            let identity = ArchiveIdentity::of_file(
                &canonical,
                &*bytes,
                self.config.index.content_fingerprint,
            )?;
            let name = canonical
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let info = SourceInfo {
                name,
                mtime: identity.mtime,
                ownership: Ownership::from_metadata(&metadata),
                identity: Some(identity),
            };
            self.open_source(bytes, info)
        })
    }

    /// Opens an archive held in `bytes`.
    ///
    /// This is how nested archives are opened; `info` stands in for the
    /// file metadata a path would provide.
    ///
    /// # Errors
    ///
    /// As [`open_archive`](Self::open_archive).
    pub fn open_source(&self, bytes: Arc<dyn ByteSource>, info: SourceInfo) -> Result<LeafSource> {
        let head = bytes.read_vec_at(0, SNIFF_LEN)?;
        let format = detect::detect(&head, &info.name);
        match format {
            ArchiveFormat::Tar => {
                self.open_stream(bytes, CodecKind::Identity, Layout::Tar, &info)
            }
            ArchiveFormat::Zip => {
                let source_id = self.allocate_source_id();
                let archive = ZipArchive::open(bytes)?;
                Ok(LeafSource::Foreign(ForeignSource::new(
                    Box::new(archive),
                    source_id,
                )?))
            }
            ArchiveFormat::SquashFs => {
                let source_id = self.allocate_source_id();
                let archive = SquashfsArchive::open(bytes)?;
                Ok(LeafSource::Foreign(ForeignSource::new(
                    Box::new(archive),
                    source_id,
                )?))
            }
            ArchiveFormat::SevenZip | ArchiveFormat::Rar | ArchiveFormat::Rar5 => Err(
                Error::UnsupportedFormat(format!("no bundled backend for {} archives", format.name())),
            ),
            ArchiveFormat::Unknown => Err(Error::UnsupportedFormat(format!(
                "{} is not a recognized archive",
                info.name
            ))),
            compressed => {
                let Some(kind) = compressed.codec() else {
                    return Err(Error::UnsupportedFormat(compressed.name().to_string()));
                };
                let codec = kind.codec()?;
                let layout = if self.holds_tar(&*codec, &bytes, &info.name)? {
                    Layout::Tar
                } else {
                    Layout::Compressed
                };
                self.open_stream(bytes, kind, layout, &info)
            }
        }
    }

    /// Builds the mount tree for `paths`.
    ///
    /// Each path is opened with [`open_archive`](Self::open_archive) and,
    /// with [`MountConfig::recursive`], wrapped in an [`AutoMountLayer`].
    /// Several paths are overlaid with [`MountConfig::union_precedence`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `paths` is empty, or holds several paths
    /// without a union precedence; otherwise the first open error.
    pub fn open_mount<P: AsRef<Path>>(
        self: &Arc<Self>,
        paths: impl IntoIterator<Item = P>,
    ) -> Result<Arc<dyn MountSource>> {
        let paths: Vec<P> = paths.into_iter().collect();
        if paths.is_empty() {
            return Err(Error::InvalidConfig("no paths to mount".into()));
        }
        if paths.len() > 1 && self.config.union_precedence.is_none() {
            return Err(Error::InvalidConfig(
                "mounting several paths requires a union precedence".into(),
            ));
        }

        let mut sources = Vec::with_capacity(paths.len());
        for path in &paths {
            let mut source: Arc<dyn MountSource> = self.open_archive(path)?;
            if self.config.recursive {
                source = Arc::new(AutoMountLayer::new(source, Arc::clone(self)));
            }
            sources.push(source);
        }
        match (sources.len(), self.config.union_precedence) {
            (1, _) | (_, None) => Ok(sources.swap_remove(0)),
            (_, Some(precedence)) => Ok(Arc::new(UnionSource::new(sources, precedence))),
        }
    }

    fn allocate_source_id(&self) -> u32 {
        self.next_source_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns true if the decoded stream starts like a tar archive.
    ///
    /// An all-zero first block is an empty tar only if the name says so.
    fn holds_tar(&self, codec: &dyn Codec, bytes: &Arc<dyn ByteSource>, name: &str) -> Result<bool> {
        let mut decoder = codec.open_decoder(Arc::clone(bytes))?;
        let mut head = [0u8; BLOCK_SIZE];
        let n = codec::read_full(&mut *decoder, &mut head).map_err(|e| Error::from_decode(e, 0))?;
        if detect::is_tar_head(&head[..n]) {
            return Ok(true);
        }
        let zero_block = n == BLOCK_SIZE && head.iter().all(|&b| b == 0);
        Ok(zero_block && detect::strip_compression_extension(name).ends_with(".tar"))
    }

    fn open_stream(
        &self,
        bytes: Arc<dyn ByteSource>,
        kind: CodecKind,
        layout: Layout,
        info: &SourceInfo,
    ) -> Result<LeafSource> {
        let codec = kind.codec()?;
        let source_id = self.allocate_source_id();
        let key = StoreKey {
            backend: layout.backend(),
            codec: kind,
            arguments: self.index_arguments(),
        };
        let builder = IndexBuilder::new(&self.config)?.source_id(source_id);
        let decoded_name = detect::strip_compression_extension(&info.name);

        let lookup = match &info.identity {
            Some(identity) => self.store.load(identity, &*bytes, &key, source_id),
            None => IndexLookup::Missing,
        };
        let (built, persist) = match lookup {
            IndexLookup::Fresh(built) => (built, false),
            IndexLookup::Appended(previous) => {
                let resume = Checkpoint::at(previous.scan_end, previous.scan_end);
                let decoder = codec.decode_from(Arc::clone(&bytes), &resume)?;
                self.settle(builder.resume(previous, decoder), &info.name)?
            }
            IndexLookup::Missing => {
                // The scan only sees the prefetching wrapper, so the inner
                // decoder learns the spacing here.
                let mut inner = codec.open_decoder(Arc::clone(&bytes))?;
                inner.set_resume_spacing(self.config.checkpoint_spacing.max(1));
                let decoder =
                    self.decoder
                        .prefetch(inner, READ_BUFFER_SIZE, self.config.prefetch_depth)?;
                let result = match layout {
                    Layout::Tar => builder.build(decoder),
                    Layout::Compressed => builder.scan_raw(
                        decoder,
                        &decoded_name,
                        info.mtime,
                        info.ownership.clone(),
                    ),
                };
                self.settle(result, &info.name)?
            }
        };

        if persist {
            if let Some(identity) = &info.identity {
                if let Err(e) = self.store.save(identity, &*bytes, &key, &built) {
                    warn!("cannot persist index of {}: {e}", identity.path.display());
                }
            }
        }

        let reader = CheckpointedReader::new(bytes, codec, Arc::new(built.checkpoints), &self.config)
            .with_parallel(Arc::clone(&self.decoder));
        Ok(match layout {
            Layout::Tar => LeafSource::Tar(TarSource::new(info.name.clone(), built.index, reader)),
            Layout::Compressed => {
                LeafSource::Compressed(CompressedFileSource::new(built.index, reader))
            }
        })
    }

    /// Accepts a finished scan, or its partial index in best-effort mode.
    ///
    /// The flag says whether the index is complete enough to persist.
    fn settle(
        &self,
        result: std::result::Result<BuiltIndex, BuildFailure>,
        name: &str,
    ) -> Result<(BuiltIndex, bool)> {
        match result {
            Ok(built) => Ok((built, true)),
            Err(failure) if self.config.best_effort && failure.error.is_corruption() => {
                warn!(
                    "mounting {} entries of damaged archive {name}: {}",
                    failure.partial.index.len(),
                    failure.error
                );
                Ok((failure.partial, false))
            }
            Err(failure) => {
                info!("cannot index {name}: {}", failure.error);
                Err(failure.error)
            }
        }
    }

    /// Options that change what an index contains.
    fn index_arguments(&self) -> String {
        let transform = self
            .config
            .transform
            .as_ref()
            .map(|t| format!("{} -> {}", t.pattern, t.replacement))
            .unwrap_or_default();
        format!(
            "transform={transform};oci_whiteouts={}",
            self.config.oci_whiteouts
        )
    }
}
