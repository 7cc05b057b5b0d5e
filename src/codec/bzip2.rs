//! bzip2 codec.
//!
//! Parallel compressors such as `pbzip2` and `lbzip2` emit one bzip2 stream
//! per block group; each stream start is a resume point. Blocks inside a
//! stream are independent too, but they start at arbitrary bit offsets. A
//! block is decoded by copying its bits behind a fresh stream header and
//! closing it with an end-of-stream marker whose checksum is the block's
//! own CRC, which makes every block a stream of its own.
//!
//! Block and end-of-stream markers are found by scanning for their 48-bit
//! magics. Streams decoded from their header also have their combined CRC
//! checked.

use std::io::{self, Cursor, Read};
use std::sync::Arc;

use bzip2::read::BzDecoder;

use super::{Codec, CodecKind, StreamDecoder};
use crate::checkpoint::{Checkpoint, CodecState};
use crate::io::ByteSource;
use crate::{Error, READ_BUFFER_SIZE, Result};

const STREAM_MAGIC: &[u8] = b"BZh";
const BLOCK_MAGIC: u64 = 0x3141_5926_5359;
const END_MAGIC: u64 = 0x1772_4538_5090;
const MARKER_BITS: u32 = 48;

/// Compressed size past which a block is taken to be missing its successor.
const MAX_BLOCK_BYTES: usize = 4 * 1024 * 1024;

/// The bzip2 codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bzip2Codec;

impl Codec for Bzip2Codec {
    fn kind(&self) -> CodecKind {
        CodecKind::Bzip2
    }

    fn frames_independently_decodable(&self) -> bool {
        true
    }

    fn decode_from(
        &self,
        source: Arc<dyn ByteSource>,
        checkpoint: &Checkpoint,
    ) -> Result<Box<dyn StreamDecoder>> {
        let offset = checkpoint.compressed_offset;
        if offset == 0 && source.read_vec_at(0, STREAM_MAGIC.len())? != STREAM_MAGIC {
            return Err(Error::corrupt(0, "not a bzip2 stream"));
        }
        let (next, level) = match checkpoint.state.as_bytes() {
            [] => (Next::Header(offset), 9),
            &[shift, level] if shift < 8 && (1..=9).contains(&level) => {
                (Next::Block(offset * 8 + u64::from(shift)), level)
            }
            _ => {
                return Err(Error::InvalidIndex(format!(
                    "malformed bzip2 block checkpoint at {offset:#x}"
                )));
            }
        };
        Ok(Box::new(Bzip2Decoder {
            source,
            level,
            next,
            block: None,
            combined: None,
            position: checkpoint.decompressed_offset,
            resume: checkpoint.clone(),
            spacing: u64::MAX,
        }))
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "bzip2 stream ended inside a block")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Block,
    End,
}

impl Marker {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            BLOCK_MAGIC => Some(Self::Block),
            END_MAGIC => Some(Self::End),
            _ => None,
        }
    }
}

/// Reads `count` bits (at most 48) starting at bit `bit`, most significant first.
///
/// Returns `None` if the source ends first.
fn bits_at(source: &dyn ByteSource, bit: u64, count: u32) -> io::Result<Option<u64>> {
    let shift = (bit % 8) as u32;
    let len = (shift + count).div_ceil(8) as usize;
    let bytes = source.read_vec_at(bit / 8, len)?;
    if bytes.len() < len {
        return Ok(None);
    }
    let value = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    let unused = len as u32 * 8 - shift - count;
    Ok(Some((value >> unused) & ((1u64 << count) - 1)))
}

/// A block's compressed bits and the marker that follows them.
struct BlockBits {
    /// Bytes from the one holding the block's first bit.
    bytes: Vec<u8>,
    /// Bit offset of the block's magic within `bytes[0]`.
    shift: u64,
    /// Length of the block in bits, magic included.
    len: u64,
    next: Marker,
}

/// Collects the block starting at bit `start` up to the next marker.
fn read_block(source: &dyn ByteSource, start: u64) -> io::Result<BlockBits> {
    let base = start / 8;
    let earliest = start + u64::from(MARKER_BITS);
    let mut bytes = Vec::with_capacity(READ_BUFFER_SIZE);
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];
    let mut window = 0u64;
    loop {
        if bytes.len() > MAX_BLOCK_BYTES {
            return Err(invalid("bzip2 block marker not found"));
        }
        let n = source.read_at(base + bytes.len() as u64, &mut chunk)?;
        if n == 0 {
            return Err(truncated());
        }
        for &byte in &chunk[..n] {
            bytes.push(byte);
            window = (window << 8) | u64::from(byte);
            let loaded_end = (base + bytes.len() as u64) * 8;
            // Earlier candidate positions first.
            for s in (0..8u32).rev() {
                let Some(at) = loaded_end.checked_sub(u64::from(s + MARKER_BITS)) else {
                    continue;
                };
                if at < earliest {
                    continue;
                }
                let candidate = (window >> s) & ((1u64 << MARKER_BITS) - 1);
                if let Some(next) = Marker::from_bits(candidate) {
                    return Ok(BlockBits {
                        bytes,
                        shift: start % 8,
                        len: at - start,
                        next,
                    });
                }
            }
        }
    }
}

/// MSB-first bit packing.
struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    bits: u32,
}

impl BitWriter {
    fn new(prefix: &[u8], capacity: usize) -> Self {
        let mut bytes = Vec::with_capacity(capacity + prefix.len());
        bytes.extend_from_slice(prefix);
        Self {
            bytes,
            acc: 0,
            bits: 0,
        }
    }

    fn push(&mut self, value: u64, count: u32) {
        self.acc = (self.acc << count) | (value & ((1u64 << count) - 1));
        self.bits += count;
        while self.bits >= 8 {
            self.bits -= 8;
            self.bytes.push((self.acc >> self.bits) as u8);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bits > 0 {
            self.bytes.push((self.acc << (8 - self.bits)) as u8);
        }
        self.bytes
    }
}

/// Wraps one block into a complete single-block stream.
fn standalone_stream(level: u8, block: &BlockBits, crc: u32) -> Vec<u8> {
    let header = [b'B', b'Z', b'h', b'0' + level];
    let mut out = BitWriter::new(&header, (block.len / 8) as usize + 16);
    let bytes = &block.bytes;
    let mut bit = block.shift;
    let end = block.shift + block.len;
    while bit + 8 <= end {
        let i = (bit / 8) as usize;
        let s = (bit % 8) as u32;
        let byte = if s == 0 {
            bytes[i]
        } else {
            (bytes[i] << s) | (bytes[i + 1] >> (8 - s))
        };
        out.push(u64::from(byte), 8);
        bit += 8;
    }
    while bit < end {
        let i = (bit / 8) as usize;
        let s = (bit % 8) as u32;
        out.push(u64::from(bytes[i] >> (7 - s)), 1);
        bit += 1;
    }
    out.push(END_MAGIC, MARKER_BITS);
    // A one-block stream's combined CRC equals the block CRC.
    out.push(u64::from(crc), 32);
    out.finish()
}

#[derive(Debug, Clone, Copy)]
enum Next {
    /// A stream header at this byte offset, or the end of the data.
    Header(u64),
    /// A block magic at this bit offset.
    Block(u64),
    /// An end-of-stream marker at this bit offset.
    End(u64),
    Done,
    Failed,
}

struct Bzip2Decoder {
    source: Arc<dyn ByteSource>,
    level: u8,
    next: Next,
    block: Option<BzDecoder<Cursor<Vec<u8>>>>,
    /// Combined CRC of the current stream, when it was decoded from its header.
    combined: Option<u32>,
    position: u64,
    resume: Checkpoint,
    spacing: u64,
}

impl Bzip2Decoder {
    fn open_stream(&mut self, offset: u64) -> io::Result<Next> {
        let header = self.source.read_vec_at(offset, 4)?;
        let level = match header.as_slice() {
            [b'B', b'Z', b'h', digit @ b'1'..=b'9'] => digit - b'0',
            // Anything that does not start like a stream is trailing padding.
            _ => return Ok(Next::Done),
        };
        self.level = level;
        self.combined = Some(0);
        self.resume = Checkpoint::at(offset, self.position);

        let first = (offset + 4) * 8;
        match bits_at(&*self.source, first, MARKER_BITS)? {
            None => Err(truncated()),
            Some(bits) => match Marker::from_bits(bits) {
                Some(Marker::Block) => Ok(Next::Block(first)),
                Some(Marker::End) => Ok(Next::End(first)),
                None => Err(invalid("bzip2 stream header is not followed by a block")),
            },
        }
    }

    fn open_block(&mut self, start: u64) -> io::Result<Next> {
        let (magic, crc) = match (
            bits_at(&*self.source, start, MARKER_BITS)?,
            bits_at(&*self.source, start + u64::from(MARKER_BITS), 32)?,
        ) {
            (Some(magic), Some(crc)) => (magic, crc as u32),
            _ => return Err(truncated()),
        };
        if magic != BLOCK_MAGIC {
            return Err(invalid(format!("no bzip2 block at bit {start:#x}")));
        }

        if self.position >= self.resume.decompressed_offset.saturating_add(self.spacing) {
            self.resume = Checkpoint {
                compressed_offset: start / 8,
                decompressed_offset: self.position,
                state: CodecState::from_bytes(vec![(start % 8) as u8, self.level]),
            };
        }

        let block = read_block(&*self.source, start)?;
        if let Some(combined) = &mut self.combined {
            *combined = combined.rotate_left(1) ^ crc;
        }
        let next_bit = start + block.len;
        let next = match block.next {
            Marker::Block => Next::Block(next_bit),
            Marker::End => Next::End(next_bit),
        };
        let stream = standalone_stream(self.level, &block, crc);
        self.block = Some(BzDecoder::new(Cursor::new(stream)));
        Ok(next)
    }

    fn end_stream(&mut self, marker: u64) -> io::Result<Next> {
        let stored = bits_at(&*self.source, marker + u64::from(MARKER_BITS), 32)?
            .ok_or_else(truncated)? as u32;
        if let Some(combined) = self.combined.take() {
            if combined != stored {
                return Err(invalid("bzip2 stream checksum mismatch"));
            }
        }
        Ok(Next::Header((marker + u64::from(MARKER_BITS) + 32).div_ceil(8)))
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(block) = &mut self.block {
                let n = block.read(buf)?;
                if n > 0 {
                    self.position += n as u64;
                    return Ok(n);
                }
                self.block = None;
            }
            self.next = match self.next {
                Next::Done => return Ok(0),
                Next::Failed => {
                    return Err(invalid("bzip2 decoder failed earlier in this stream"));
                }
                Next::Header(offset) => self.open_stream(offset)?,
                Next::Block(bit) => self.open_block(bit)?,
                Next::End(bit) => self.end_stream(bit)?,
            };
        }
    }
}

impl Read for Bzip2Decoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let result = self.read_inner(buf);
        if result.is_err() {
            self.block = None;
            self.next = Next::Failed;
        }
        result
    }
}

impl StreamDecoder for Bzip2Decoder {
    fn position(&self) -> u64 {
        self.position
    }

    fn snapshot_state(&self) -> Checkpoint {
        self.resume.clone()
    }

    fn set_resume_spacing(&mut self, spacing: u64) {
        self.spacing = spacing.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySource;
    use bzip2::Compression;
    use bzip2::write::BzEncoder;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Write;

    fn bzip(data: &[u8], level: Compression) -> Vec<u8> {
        let mut encoder = BzEncoder::new(Vec::new(), level);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn letters(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| b'a' + rng.gen_range(0..16u8)).collect()
    }

    #[test]
    fn test_multi_stream() {
        let first = bzip(b"alpha ", Compression::default());
        let mut data = first.clone();
        data.extend_from_slice(&bzip(b"beta", Compression::default()));

        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(data));
        let mut decoder = Bzip2Codec.open_decoder(Arc::clone(&source)).unwrap();
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"alpha beta");
        assert_eq!(decoder.snapshot_state(), Checkpoint::at(first.len() as u64, 6));

        let mut second = Bzip2Codec
            .decode_from(source, &Checkpoint::at(first.len() as u64, 6))
            .unwrap();
        let mut out = Vec::new();
        second.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"beta");
    }

    #[test]
    fn test_blocks_inside_one_stream_are_resume_points() {
        let data = letters(720_000, 3);
        let source: Arc<dyn ByteSource> =
            Arc::new(MemorySource::new(bzip(&data, Compression::fast())));
        let mut decoder = Bzip2Codec.open_decoder(Arc::clone(&source)).unwrap();
        decoder.set_resume_spacing(1);

        let mut points: Vec<Checkpoint> = Vec::new();
        let mut chunk = vec![0u8; 16 * 1024];
        let mut out = Vec::new();
        loop {
            let n = decoder.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
            let resume = decoder.snapshot_state();
            if !resume.state.is_empty() && points.last() != Some(&resume) {
                points.push(resume);
            }
        }
        assert_eq!(out, data);
        assert!(points.len() >= 5, "only {} block points", points.len());
        // Most block magics do not start on a byte boundary.
        assert!(points.iter().any(|p| p.state.as_bytes()[0] != 0));

        for point in &points {
            let start = point.decompressed_offset as usize;
            let mut resumed = Bzip2Codec.decode_from(Arc::clone(&source), point).unwrap();
            let mut head = vec![0u8; 2000];
            resumed.read_exact(&mut head).unwrap();
            assert_eq!(head, &data[start..start + 2000]);
        }

        let last = points.last().unwrap();
        let mut resumed = Bzip2Codec.decode_from(source, last).unwrap();
        let mut tail = Vec::new();
        resumed.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[last.decompressed_offset as usize..]);
    }

    #[test]
    fn test_checkpoint_off_a_block_is_rejected() {
        let data = bzip(&letters(10_000, 1), Compression::fast());
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(data));
        let bad = Checkpoint {
            compressed_offset: 20,
            decompressed_offset: 10,
            state: CodecState::from_bytes(vec![3, 1]),
        };
        let mut decoder = Bzip2Codec.decode_from(source, &bad).unwrap();
        let mut out = Vec::new();
        let err = decoder.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_stream_fails() {
        let data = bzip(&letters(300_000, 9), Compression::fast());
        let cut = data[..data.len() / 2].to_vec();
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(cut));
        let mut decoder = Bzip2Codec.open_decoder(source).unwrap();
        let mut out = Vec::new();
        assert!(decoder.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_rejects_non_bzip2() {
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(b"BZ no".to_vec()));
        assert!(Bzip2Codec.open_decoder(source).unwrap_err().is_corruption());
    }
}
