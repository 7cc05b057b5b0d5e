//! GNU sparse file maps.
//!
//! A sparse member stores only its data runs, back to back; the map says
//! where each run belongs in the restored file. Three encodings are in use:
//!
//! - old GNU (`S` typeflag): four map slots in the header, more in
//!   extension blocks that follow it, real size at offset 483;
//! - PAX 0.0 and 0.1: the map travels in the extended header, as repeated
//!   `GNU.sparse.offset`/`GNU.sparse.numbytes` records or as one
//!   comma-separated `GNU.sparse.map`;
//! - PAX 1.0: decimal numbers, one per line, at the start of the member
//!   data (count first), padded to a block.

use super::header::{BLOCK_SIZE, parse_numeric};
use crate::index::SparseSegment;
use crate::{Error, Result};

/// Map slots of the old GNU header.
const HEADER_SLOTS: std::ops::Range<usize> = 386..482;
const HEADER_EXTENDED: usize = 482;
const HEADER_REAL_SIZE: std::ops::Range<usize> = 483..495;
/// Map slots of an extension block.
const EXTENSION_SLOTS: std::ops::Range<usize> = 0..504;
const EXTENSION_EXTENDED: usize = 504;
const SLOT: usize = 24;

/// Upper bound on the segments of one file.
pub(crate) const MAX_SEGMENTS: usize = 1 << 20;

/// The sparse part of an old GNU header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OldGnuSparse {
    pub segments: Vec<SparseSegment>,
    /// An extension block follows.
    pub extended: bool,
    pub real_size: u64,
}

impl OldGnuSparse {
    pub(crate) fn parse(block: &[u8; BLOCK_SIZE], offset: u64) -> Result<Self> {
        let mut segments = Vec::new();
        read_slots(&block[HEADER_SLOTS], offset, &mut segments)?;
        let real_size = parse_numeric(&block[HEADER_REAL_SIZE])
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| Error::corrupt(offset, "invalid sparse real size"))?;
        Ok(Self {
            segments,
            extended: block[HEADER_EXTENDED] != 0,
            real_size,
        })
    }
}

/// Appends the slots of an extension block and says whether another follows.
pub(crate) fn parse_extension(
    block: &[u8; BLOCK_SIZE],
    offset: u64,
    segments: &mut Vec<SparseSegment>,
) -> Result<bool> {
    read_slots(&block[EXTENSION_SLOTS], offset, segments)?;
    if segments.len() > MAX_SEGMENTS {
        return Err(Error::corrupt(offset, "too many sparse segments"));
    }
    Ok(block[EXTENSION_EXTENDED] != 0)
}

fn read_slots(slots: &[u8], offset: u64, segments: &mut Vec<SparseSegment>) -> Result<()> {
    for slot in slots.chunks_exact(SLOT) {
        if slot[0] == 0 {
            break;
        }
        let number = |field: &[u8]| {
            parse_numeric(field)
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| Error::corrupt(offset, "invalid sparse map slot"))
        };
        segments.push(SparseSegment {
            offset: number(&slot[..12])?,
            len: number(&slot[12..])?,
        });
    }
    Ok(())
}

/// Pairs up `offset, len, offset, len, ...`.
pub(crate) fn pairs(numbers: &[u64], offset: u64) -> Result<Vec<SparseSegment>> {
    if numbers.len() % 2 != 0 {
        return Err(Error::corrupt(offset, "sparse map with an odd number of values"));
    }
    Ok(numbers
        .chunks_exact(2)
        .map(|pair| SparseSegment {
            offset: pair[0],
            len: pair[1],
        })
        .collect())
}

/// Parses the comma-separated value of `GNU.sparse.map`.
pub(crate) fn parse_map_value(value: &[u8]) -> Option<Vec<u64>> {
    let text = std::str::from_utf8(value).ok()?.trim();
    if text.is_empty() {
        return Some(Vec::new());
    }
    text.split(',').map(|n| n.trim().parse().ok()).collect()
}

/// Parses the PAX 1.0 map at the start of `data`.
///
/// Returns `None` while the map continues past the end of `data`.
pub(crate) fn parse_data_map(data: &[u8], offset: u64) -> Result<Option<Vec<SparseSegment>>> {
    let mut rest = data;
    let mut count: Option<usize> = None;
    let mut numbers = Vec::new();
    loop {
        if count == Some(numbers.len() / 2) && numbers.len() % 2 == 0 {
            return pairs(&numbers, offset).map(Some);
        }
        let Some(end) = rest.iter().position(|&b| b == b'\n') else {
            if rest.contains(&0) {
                return Err(Error::corrupt(offset, "sparse map ends before its last value"));
            }
            return Ok(None);
        };
        let value = std::str::from_utf8(&rest[..end])
            .ok()
            .and_then(|line| line.parse::<u64>().ok())
            .ok_or_else(|| Error::corrupt(offset, "invalid number in sparse map"))?;
        rest = &rest[end + 1..];
        match count {
            None => {
                let n = usize::try_from(value).unwrap_or(usize::MAX);
                if n > MAX_SEGMENTS {
                    return Err(Error::corrupt(offset, "too many sparse segments"));
                }
                count = Some(n);
            }
            Some(_) => numbers.push(value),
        }
    }
}
