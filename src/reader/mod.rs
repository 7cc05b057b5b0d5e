//! Checkpointed random access over a compressed stream.
//!
//! [`CheckpointedReader`] turns a sequential-only decoder into
//! offset-addressable reads. A read at `offset` resumes from the greatest
//! checkpoint at or before it (or from a pooled decoder that is closer),
//! discards decoded bytes up to `offset` and returns the requested range.
//! Resume points crossed on the way are added to the checkpoint list when
//! they are at least the configured spacing past their predecessor, so
//! later seeks into the same region get cheaper.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use seekstone::{CheckpointList, CheckpointedReader, CodecKind, MemorySource, MountConfig};
//!
//! let source = Arc::new(MemorySource::new(b"0123456789".to_vec()));
//! let reader = CheckpointedReader::new(
//!     source,
//!     CodecKind::Identity.codec()?,
//!     Arc::new(CheckpointList::new()),
//!     &MountConfig::default(),
//! );
//! assert_eq!(reader.read(3, 4)?, b"3456");
//! assert!(reader.read(42, 4)?.is_empty());
//! # Ok::<(), seekstone::Error>(())
//! ```

mod pool;

pub use pool::{DecoderPool, PoolStats};

use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::checkpoint::{Checkpoint, CheckpointList};
use crate::codec::{Codec, StreamDecoder, read_full};
use crate::config::MountConfig;
use crate::io::ByteSource;
use crate::parallel::{BlockParallelDecoder, CancellationToken};
use crate::{Error, READ_BUFFER_SIZE, Result};

/// Decoded bytes handled between two cancellation checks.
const STEP: usize = READ_BUFFER_SIZE;

/// Offset-addressable reads over one compressed stream.
pub struct CheckpointedReader {
    source: Arc<dyn ByteSource>,
    codec: Arc<dyn Codec>,
    checkpoints: Arc<CheckpointList>,
    pool: Mutex<DecoderPool>,
    spacing: u64,
    parallel: Option<Arc<BlockParallelDecoder>>,
    parallel_threshold: usize,
}

impl std::fmt::Debug for CheckpointedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointedReader")
            .field("codec", &self.codec.kind())
            .field("checkpoints", &self.checkpoints.len())
            .field("spacing", &self.spacing)
            .finish_non_exhaustive()
    }
}

impl CheckpointedReader {
    /// Binds a reader to a stream, its codec and its checkpoints.
    pub fn new(
        source: Arc<dyn ByteSource>,
        codec: Arc<dyn Codec>,
        checkpoints: Arc<CheckpointList>,
        config: &MountConfig,
    ) -> Self {
        Self {
            source,
            codec,
            checkpoints,
            pool: Mutex::new(DecoderPool::new(config.effective_pool_capacity())),
            spacing: config.checkpoint_spacing.max(1),
            parallel: None,
            parallel_threshold: config.parallel_read_threshold,
        }
    }

    /// Serves large reads with the block-parallel decoder when the codec allows it.
    pub fn with_parallel(mut self, decoder: Arc<BlockParallelDecoder>) -> Self {
        self.parallel = Some(decoder);
        self
    }

    /// The checkpoints of this stream.
    pub fn checkpoints(&self) -> &Arc<CheckpointList> {
        &self.checkpoints
    }

    /// The codec of this stream.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// The compressed byte source.
    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }

    /// Decoder pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.lock_pool().stats()
    }

    /// Reads `len` decoded bytes at `offset`.
    ///
    /// Returns fewer bytes only at the end of the stream, and nothing for
    /// offsets past it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TruncatedArchive`] if the compressed data ends early
    /// and [`Error::CorruptArchive`] if the codec rejects it.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.read_cancellable(offset, len, &CancellationToken::new())
    }

    /// Like [`read`](Self::read), but gives up with [`Error::Cancelled`]
    /// once `cancel` fires.
    ///
    /// A cancelled read inserts no checkpoints and parks no decoder.
    pub fn read_cancellable(
        &self,
        offset: u64,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        if self.codec.random_access() {
            return self.read_direct(offset, len, cancel);
        }

        if let Some(parallel) = self.parallel_for(offset, len) {
            return parallel.decode_range(
                &self.source,
                &*self.codec,
                &self.checkpoints,
                offset,
                len,
                cancel,
            );
        }

        let floor = self.checkpoints.floor(offset);
        let pooled = self.lock_pool().take(floor.decompressed_offset, offset);
        let mut decoder = match pooled {
            Some(decoder) => decoder,
            None => {
                let mut decoder = self.codec.decode_from(Arc::clone(&self.source), &floor)?;
                decoder.set_resume_spacing(self.spacing);
                decoder
            }
        };

        let mut found = Vec::new();
        let mut last = floor;

        while decoder.position() < offset {
            cancel.check()?;
            let position = decoder.position();
            let step = (offset - position).min(STEP as u64);
            let skipped = decoder
                .skip(step)
                .map_err(|e| Error::from_decode(e, position))?;
            self.observe(&*decoder, &mut last, &mut found);
            if skipped < step {
                self.commit(found);
                return Ok(Vec::new());
            }
        }

        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            cancel.check()?;
            let want = (len - filled).min(STEP);
            let n = read_full(&mut *decoder, &mut out[filled..filled + want])
                .map_err(|e| Error::from_decode(e, offset + filled as u64))?;
            filled += n;
            self.observe(&*decoder, &mut last, &mut found);
            if n < want {
                break;
            }
        }
        out.truncate(filled);

        self.commit(found);
        if filled == len {
            self.lock_pool().put(decoder);
        }
        Ok(out)
    }

    fn read_direct(&self, offset: u64, len: usize, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut decoder = self
            .codec
            .decode_from(Arc::clone(&self.source), &Checkpoint::at(offset, offset))?;
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            cancel.check()?;
            let want = (len - filled).min(STEP);
            let n = read_full(&mut *decoder, &mut out[filled..filled + want])
                .map_err(|e| Error::from_decode(e, offset + filled as u64))?;
            filled += n;
            if n < want {
                break;
            }
        }
        out.truncate(filled);
        Ok(out)
    }

    fn parallel_for(&self, offset: u64, len: usize) -> Option<&BlockParallelDecoder> {
        let parallel = self.parallel.as_deref()?;
        if !parallel.is_parallel()
            || !self.codec.frames_independently_decodable()
            || len < self.parallel_threshold
        {
            return None;
        }
        let granules = self
            .checkpoints
            .covering(offset, offset.saturating_add(len as u64));
        (granules.len() > 1).then_some(parallel)
    }

    /// Remembers the decoder's latest resume point if it is far enough past the last one.
    fn observe(&self, decoder: &dyn StreamDecoder, last: &mut Checkpoint, found: &mut Vec<Checkpoint>) {
        let resume = decoder.snapshot_state();
        if resume.decompressed_offset >= last.decompressed_offset.saturating_add(self.spacing)
            && resume.compressed_offset > last.compressed_offset
        {
            *last = resume.clone();
            found.push(resume);
        }
    }

    fn commit(&self, found: Vec<Checkpoint>) {
        for checkpoint in found {
            let floor = self.checkpoints.floor(checkpoint.decompressed_offset);
            if checkpoint.decompressed_offset < floor.decompressed_offset.saturating_add(self.spacing) {
                continue;
            }
            let (c, d) = (checkpoint.compressed_offset, checkpoint.decompressed_offset);
            if self.checkpoints.insert(checkpoint) {
                debug!("inserted checkpoint at compressed {c:#x} / decoded {d:#x}");
            }
        }
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, DecoderPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
