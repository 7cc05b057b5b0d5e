//! Block-parallel decoding.
//!
//! Codecs whose resume points are independently decodable (gzip members,
//! bzip2 streams, zstd frames) let a large read be split into granules, one
//! per checkpoint interval, that decode concurrently on a bounded worker pool.
//! Results are reassembled in stream order. The first failing granule
//! cancels the rest and its error is returned.
//!
//! Decode-ahead for index scans runs on its own thread:
//! [`BlockParallelDecoder::prefetch`] moves a decoder onto a dedicated
//! `seekstone-prefetch` thread and hands its output to the parser through a
//! bounded channel. A scan blocks on that channel, so it must never wait on
//! a worker that granule decoding can keep busy.
//!
//! Without the `parallel` feature every operation runs sequentially on the
//! calling thread.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::checkpoint::{Checkpoint, CheckpointList};
use crate::codec::{Codec, StreamDecoder, read_full};
use crate::config::Threads;
use crate::io::ByteSource;
use crate::{Error, READ_BUFFER_SIZE, Result};

/// Cooperative cancellation of a read or a scan.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the operation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Checks if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns [`Error::Cancelled`] once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One independently decodable slice of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Granule {
    start: Checkpoint,
    from: u64,
    to: u64,
}

/// Splits `[offset, end)` at every checkpoint inside it.
fn plan(checkpoints: &CheckpointList, offset: u64, end: u64) -> Vec<Granule> {
    let starts = checkpoints.covering(offset, end);
    let mut granules = Vec::with_capacity(starts.len());
    for (i, start) in starts.iter().enumerate() {
        let from = offset.max(start.decompressed_offset);
        let to = starts
            .get(i + 1)
            .map_or(end, |next| next.decompressed_offset.min(end));
        if from < to {
            granules.push(Granule {
                start: start.clone(),
                from,
                to,
            });
        }
    }
    granules
}

fn decode_granule(
    source: &Arc<dyn ByteSource>,
    codec: &dyn Codec,
    granule: &Granule,
    stopped: &dyn Fn() -> bool,
) -> Result<Vec<u8>> {
    let check = || if stopped() { Err(Error::Cancelled) } else { Ok(()) };
    check()?;
    let mut decoder = codec.decode_from(Arc::clone(source), &granule.start)?;
    let mut to_skip = granule.from - granule.start.decompressed_offset;
    while to_skip > 0 {
        check()?;
        let step = to_skip.min(READ_BUFFER_SIZE as u64 * 16);
        let skipped = decoder
            .skip(step)
            .map_err(|e| Error::from_decode(e, decoder.position()))?;
        if skipped == 0 {
            return Ok(Vec::new());
        }
        to_skip -= skipped;
    }

    let len = (granule.to - granule.from) as usize;
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        check()?;
        let want = (len - filled).min(READ_BUFFER_SIZE * 16);
        let n = read_full(&mut *decoder, &mut out[filled..filled + want])
            .map_err(|e| Error::from_decode(e, granule.from + filled as u64))?;
        filled += n;
        if n < want {
            break;
        }
    }
    out.truncate(filled);
    Ok(out)
}

/// Decodes checkpoint-bounded granules concurrently.
pub struct BlockParallelDecoder {
    threads: usize,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for BlockParallelDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockParallelDecoder")
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

impl BlockParallelDecoder {
    /// Creates a decoder with its own worker pool.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the worker threads cannot be spawned.
    pub fn new(threads: Threads) -> Result<Self> {
        let threads = threads.count();

        #[cfg(feature = "parallel")]
        let pool = if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("seekstone-decode-{i}"))
                .build()
                .map_err(|e| Error::Io(io::Error::other(e)))?;
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            threads,
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    /// Creates a decoder that runs everything on the calling thread.
    pub fn sequential() -> Self {
        Self {
            threads: 1,
            #[cfg(feature = "parallel")]
            pool: None,
        }
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Returns true if work actually runs on a pool.
    pub fn is_parallel(&self) -> bool {
        #[cfg(feature = "parallel")]
        {
            self.pool.is_some()
        }
        #[cfg(not(feature = "parallel"))]
        {
            false
        }
    }

    /// Decodes `[offset, offset + len)` of the stream.
    ///
    /// Returns fewer bytes only at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns the first granule failure, or [`Error::Cancelled`] if `cancel`
    /// fires first.
    pub fn decode_range(
        &self,
        source: &Arc<dyn ByteSource>,
        codec: &dyn Codec,
        checkpoints: &CheckpointList,
        offset: u64,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let granules = plan(checkpoints, offset, offset.saturating_add(len as u64));
        if granules.is_empty() {
            return Ok(Vec::new());
        }

        // A failing granule stops its siblings through a private flag so the
        // caller's token only ever reflects the caller's own cancellation.
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let stopped = || failed.load(Ordering::SeqCst) || cancel.is_cancelled();
        let run = |granule: &Granule| -> Option<Vec<u8>> {
            match decode_granule(source, codec, granule, &stopped) {
                Ok(bytes) => Some(bytes),
                Err(Error::Cancelled) => None,
                Err(e) => {
                    let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    failed.store(true, Ordering::SeqCst);
                    None
                }
            }
        };

        #[cfg(feature = "parallel")]
        let parts: Vec<Option<Vec<u8>>> = match &self.pool {
            Some(pool) => pool.install(|| granules.par_iter().map(run).collect()),
            None => granules.iter().map(run).collect(),
        };
        #[cfg(not(feature = "parallel"))]
        let parts: Vec<Option<Vec<u8>>> = granules.iter().map(run).collect();

        if let Some(e) = first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(e);
        }
        cancel.check()?;

        let mut out = Vec::with_capacity(len);
        for (granule, part) in granules.iter().zip(parts) {
            let Some(part) = part else {
                return Err(Error::Cancelled);
            };
            let complete = part.len() as u64 == granule.to - granule.from;
            out.extend_from_slice(&part);
            if !complete {
                break;
            }
        }
        Ok(out)
    }

    /// Runs `decoder` ahead of its consumer on a dedicated thread.
    ///
    /// Decoded chunks of `chunk_size` bytes are buffered up to `depth` deep.
    /// Dropping the returned decoder stops the thread at its next chunk.
    /// A sequential decoder returns `decoder` unchanged.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn prefetch(
        &self,
        decoder: Box<dyn StreamDecoder>,
        chunk_size: usize,
        depth: usize,
    ) -> Result<Box<dyn StreamDecoder>> {
        if !self.is_parallel() {
            return Ok(decoder);
        }
        let position = decoder.position();
        let resume = decoder.snapshot_state();
        let (tx, rx) = sync_channel(depth.max(1));
        std::thread::Builder::new()
            .name("seekstone-prefetch".into())
            .spawn(move || produce(decoder, tx, chunk_size.max(1)))?;
        Ok(Box::new(PrefetchDecoder::new(rx, position, resume)))
    }
}

struct Chunk {
    data: Vec<u8>,
    resume: Checkpoint,
}

fn produce(mut decoder: Box<dyn StreamDecoder>, tx: SyncSender<io::Result<Chunk>>, chunk: usize) {
    loop {
        let mut data = vec![0u8; chunk];
        let message = match read_full(&mut *decoder, &mut data) {
            Ok(n) => {
                data.truncate(n);
                Ok(Chunk {
                    data,
                    resume: decoder.snapshot_state(),
                })
            }
            Err(e) => Err(e),
        };
        let last = !matches!(&message, Ok(c) if !c.data.is_empty());
        if tx.send(message).is_err() || last {
            return;
        }
    }
}

/// Consumer side of a prefetching decoder.
struct PrefetchDecoder {
    rx: Receiver<io::Result<Chunk>>,
    current: Vec<u8>,
    cursor: usize,
    position: u64,
    resume: Checkpoint,
    pending: Option<Checkpoint>,
    finished: bool,
}

impl PrefetchDecoder {
    fn new(rx: Receiver<io::Result<Chunk>>, position: u64, resume: Checkpoint) -> Self {
        Self {
            rx,
            current: Vec::new(),
            cursor: 0,
            position,
            resume,
            pending: None,
            finished: false,
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        // Everything in the previous chunk has been consumed, so its resume
        // point is behind the read position.
        if let Some(pending) = self.pending.take() {
            self.resume = pending;
        }
        match self.rx.recv() {
            Ok(Ok(chunk)) => {
                if chunk.data.is_empty() {
                    self.finished = true;
                    self.resume = chunk.resume;
                } else {
                    self.current = chunk.data;
                    self.cursor = 0;
                    self.pending = Some(chunk.resume);
                }
                Ok(())
            }
            Ok(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            Err(_) => {
                self.finished = true;
                Err(io::Error::other("decode-ahead worker stopped unexpectedly"))
            }
        }
    }
}

impl Read for PrefetchDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.cursor == self.current.len() {
            if self.finished || buf.is_empty() {
                return Ok(0);
            }
            self.refill()?;
        }
        let n = (self.current.len() - self.cursor).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.cursor..self.cursor + n]);
        self.cursor += n;
        self.position += n as u64;
        Ok(n)
    }
}

impl StreamDecoder for PrefetchDecoder {
    fn position(&self) -> u64 {
        self.position
    }

    fn snapshot_state(&self) -> Checkpoint {
        match &self.pending {
            Some(p) if p.decompressed_offset <= self.position => p.clone(),
            _ => self.resume.clone(),
        }
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut remaining = n;
        while remaining > 0 {
            if self.cursor == self.current.len() {
                if self.finished {
                    break;
                }
                self.refill()?;
                continue;
            }
            let step = ((self.current.len() - self.cursor) as u64).min(remaining) as usize;
            self.cursor += step;
            self.position += step as u64;
            remaining -= step as u64;
        }
        Ok(n - remaining)
    }
}
