//! Checkpoints: saved decoder positions.
//!
//! A [`Checkpoint`] pairs a compressed offset with the decoded offset it
//! produces and the opaque [`CodecState`] needed to resume there. A
//! [`CheckpointList`] keeps them ordered with both offsets strictly
//! increasing. It only grows: checkpoints are inserted (by the index builder
//! and opportunistically by readers) but never removed or reordered.

use std::sync::{Arc, PoisonError, RwLock};

use crate::{Error, Result};

/// Opaque codec state needed to resume decoding at a checkpoint.
///
/// Codecs that resume at member or frame boundaries need no state and use
/// [`CodecState::empty`]. A gzip seek point inside a member carries its
/// 32 KiB window, so clones share one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodecState(Arc<[u8]>);

impl Default for CodecState {
    fn default() -> Self {
        Self::empty()
    }
}

impl CodecState {
    /// The empty state.
    pub fn empty() -> Self {
        Self(Arc::from(Vec::<u8>::new()))
    }

    /// Wraps serialized codec state.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }

    /// Returns true if there is no state to restore.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The serialized state.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A saved decoder position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checkpoint {
    /// Offset in the compressed stream where decoding resumes.
    pub compressed_offset: u64,
    /// Decoded offset produced by resuming at `compressed_offset`.
    pub decompressed_offset: u64,
    /// Codec state to restore.
    pub state: CodecState,
}

impl Checkpoint {
    /// The start of every stream.
    pub fn origin() -> Self {
        Self::at(0, 0)
    }

    /// A stateless checkpoint.
    pub fn at(compressed_offset: u64, decompressed_offset: u64) -> Self {
        Self {
            compressed_offset,
            decompressed_offset,
            state: CodecState::empty(),
        }
    }

    /// Returns true if `next` may follow this checkpoint.
    fn precedes(&self, next: &Checkpoint) -> bool {
        self.compressed_offset < next.compressed_offset
            && self.decompressed_offset < next.decompressed_offset
    }
}

/// An ordered, grow-only sequence of checkpoints for one stream.
///
/// The origin `(0, 0)` is always present. Inserts that would break strict
/// monotonicity of either offset are discarded.
#[derive(Debug)]
pub struct CheckpointList {
    points: RwLock<Vec<Checkpoint>>,
}

impl Default for CheckpointList {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointList {
    /// Creates a list holding only the origin.
    pub fn new() -> Self {
        Self {
            points: RwLock::new(vec![Checkpoint::origin()]),
        }
    }

    /// Builds a list from persisted checkpoints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIndex`] if the sequence is not strictly
    /// increasing in both offsets or does not start at the origin.
    pub fn from_vec(mut points: Vec<Checkpoint>) -> Result<Self> {
        if points.first().is_none_or(|first| first.decompressed_offset != 0) {
            points.insert(0, Checkpoint::origin());
        }
        if points[0].compressed_offset != 0 {
            return Err(Error::InvalidIndex(
                "first checkpoint does not start the stream".into(),
            ));
        }
        if let Some(bad) = points.windows(2).position(|w| !w[0].precedes(&w[1])) {
            return Err(Error::InvalidIndex(format!(
                "checkpoint {} is not after its predecessor",
                bad + 1
            )));
        }
        Ok(Self {
            points: RwLock::new(points),
        })
    }

    /// Number of checkpoints, including the origin.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Always false: the origin is always present.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The greatest checkpoint whose decoded offset is `<= offset`.
    pub fn floor(&self, offset: u64) -> Checkpoint {
        let points = self.read();
        let idx = points.partition_point(|p| p.decompressed_offset <= offset);
        points[idx.saturating_sub(1)].clone()
    }

    /// The checkpoints that start granules covering `[start, end)`.
    ///
    /// The first element is `floor(start)`; the rest are every checkpoint
    /// strictly inside the range, in order.
    pub fn covering(&self, start: u64, end: u64) -> Vec<Checkpoint> {
        let points = self.read();
        let first = points
            .partition_point(|p| p.decompressed_offset <= start)
            .saturating_sub(1);
        points[first..]
            .iter()
            .enumerate()
            .take_while(|(i, p)| *i == 0 || p.decompressed_offset < end)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Inserts a checkpoint if it keeps both offsets strictly increasing.
    ///
    /// Returns true if the checkpoint was inserted. A checkpoint with the
    /// same decoded offset as an existing one is discarded, so the earliest
    /// created one wins.
    pub fn insert(&self, checkpoint: Checkpoint) -> bool {
        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        let idx = points.partition_point(|p| p.decompressed_offset < checkpoint.decompressed_offset);
        let after_prev = idx == 0 || points[idx - 1].precedes(&checkpoint);
        let before_next = points.get(idx).is_none_or(|next| checkpoint.precedes(next));
        if !(after_prev && before_next) {
            return false;
        }
        points.insert(idx, checkpoint);
        true
    }

    /// The last checkpoint.
    pub fn last(&self) -> Checkpoint {
        let points = self.read();
        points[points.len() - 1].clone()
    }

    /// A copy of all checkpoints, in order.
    pub fn to_vec(&self) -> Vec<Checkpoint> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Checkpoint>> {
        self.points.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for CheckpointList {
    fn clone(&self) -> Self {
        Self {
            points: RwLock::new(self.to_vec()),
        }
    }
}
