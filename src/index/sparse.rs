//! Layout of sparse file contents.

use std::sync::Arc;

/// One run of stored data inside a sparse file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SparseSegment {
    /// Offset of the run in the restored file.
    pub offset: u64,
    /// Length of the run.
    pub len: u64,
}

/// Where the data of a sparse file lives.
///
/// Segments are ordered and do not overlap. Their bytes are stored back to
/// back from the entry's content offset; everything between them reads as
/// zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseMap(Arc<[SparseSegment]>);

/// A slice of a logical read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparsePiece {
    /// `len` stored bytes, `stored` bytes past the start of the stored data.
    Data {
        /// Offset into the stored data.
        stored: u64,
        /// Number of bytes.
        len: u64,
    },
    /// `len` zero bytes.
    Hole {
        /// Number of bytes.
        len: u64,
    },
}

impl SparseMap {
    /// Builds a map for a file of `size` bytes.
    ///
    /// Empty segments are dropped. Returns `None` if the segments are out of
    /// order, overlap, or reach past `size`.
    pub fn new(segments: Vec<SparseSegment>, size: u64) -> Option<Self> {
        let segments: Vec<SparseSegment> = segments.into_iter().filter(|s| s.len > 0).collect();
        let mut end = 0u64;
        for segment in &segments {
            if segment.offset < end {
                return None;
            }
            end = segment.offset.checked_add(segment.len)?;
        }
        (end <= size).then(|| Self(segments.into()))
    }

    /// The data runs in file order.
    pub fn segments(&self) -> &[SparseSegment] {
        &self.0
    }

    /// Number of bytes actually stored.
    pub fn stored_len(&self) -> u64 {
        self.0.iter().map(|s| s.len).sum()
    }

    /// Splits `[offset, offset + len)` of the restored file into stored runs
    /// and holes.
    pub fn pieces(&self, offset: u64, len: u64) -> Vec<SparsePiece> {
        let end = offset.saturating_add(len);
        let mut pieces = Vec::new();
        let mut pos = offset;
        let mut stored = 0u64;
        for segment in self.0.iter() {
            if pos >= end {
                break;
            }
            let segment_end = segment.offset + segment.len;
            if segment_end <= pos {
                stored += segment.len;
                continue;
            }
            if segment.offset >= end {
                break;
            }
            if segment.offset > pos {
                pieces.push(SparsePiece::Hole {
                    len: segment.offset - pos,
                });
                pos = segment.offset;
            }
            let take = segment_end.min(end) - pos;
            pieces.push(SparsePiece::Data {
                stored: stored + (pos - segment.offset),
                len: take,
            });
            pos += take;
            stored += segment.len;
        }
        if pos < end {
            pieces.push(SparsePiece::Hole { len: end - pos });
        }
        pieces
    }

    /// Serializes the map as little-endian `(offset, len)` pairs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 16);
        for segment in self.0.iter() {
            out.extend_from_slice(&segment.offset.to_le_bytes());
            out.extend_from_slice(&segment.len.to_le_bytes());
        }
        out
    }

    /// Reverses [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8], size: u64) -> Option<Self> {
        if bytes.len() % 16 != 0 {
            return None;
        }
        let word = |b: &[u8]| u64::from_le_bytes(b.try_into().unwrap_or_default());
        let segments = bytes
            .chunks_exact(16)
            .map(|pair| SparseSegment {
                offset: word(&pair[..8]),
                len: word(&pair[8..]),
            })
            .collect();
        Self::new(segments, size)
    }
}
