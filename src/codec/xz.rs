//! xz codec.
//!
//! An xz file ends with an index listing the compressed and decoded size
//! of every block, and each block starts a fresh LZMA2 dictionary. When the
//! index is intact and the blocks use plain LZMA2, every block start is a
//! resume point and blocks are decoded one at a time with their checks
//! verified here.
//!
//! Files whose index cannot be read (truncated downloads) or whose blocks
//! use other filter chains fall back to decoding the whole file from its
//! start.

use std::io::{self, BufReader, Read};
use std::sync::Arc;

use log::debug;
use lzma_rust2::{Lzma2Reader, XzReader};
use sha2::{Digest, Sha256};

use super::{Codec, CodecKind, StreamDecoder};
use crate::checkpoint::Checkpoint;
use crate::io::{ByteSource, SourceReader};
use crate::{Error, READ_BUFFER_SIZE, Result};

const XZ_MAGIC: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];
const FOOTER_MAGIC: &[u8] = b"YZ";
const STREAM_HEADER_SIZE: u64 = 12;
const STREAM_FOOTER_SIZE: u64 = 12;
const LZMA2_FILTER: u64 = 0x21;

const CHECK_NONE: u8 = 0x00;
const CHECK_CRC32: u8 = 0x01;
const CHECK_CRC64: u8 = 0x04;
const CHECK_SHA256: u8 = 0x0A;

/// Indexes larger than this are treated as corruption.
const MAX_INDEX_SIZE: u64 = 64 * 1024 * 1024;

/// The xz codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct XzCodec;

impl Codec for XzCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Xz
    }

    fn frames_independently_decodable(&self) -> bool {
        true
    }

    fn decode_from(
        &self,
        source: Arc<dyn ByteSource>,
        checkpoint: &Checkpoint,
    ) -> Result<Box<dyn StreamDecoder>> {
        let at_origin = checkpoint.compressed_offset == 0 && checkpoint.decompressed_offset == 0;
        if at_origin && source.read_vec_at(0, XZ_MAGIC.len())? != XZ_MAGIC {
            return Err(Error::corrupt(0, "not an xz stream"));
        }

        let blocks = match read_layout(&*source) {
            Ok(blocks) => Some(blocks),
            Err(e) if at_origin => {
                debug!("decoding xz sequentially: {e}");
                None
            }
            Err(e) => return Err(Error::from_decode(e, checkpoint.decompressed_offset)),
        };
        let blocks = match blocks {
            Some(blocks) if at_origin && !starts_with_plain_lzma2(&*source, &blocks)? => None,
            other => other,
        };

        let Some(blocks) = blocks else {
            let reader = BufReader::with_capacity(READ_BUFFER_SIZE, SourceReader::new(source, 0));
            return Ok(Box::new(SequentialXz {
                inner: XzReader::new(reader, true),
                position: 0,
            }));
        };

        let next = if at_origin {
            0
        } else {
            blocks
                .iter()
                .position(|b| {
                    b.offset == checkpoint.compressed_offset
                        && b.decoded_offset == checkpoint.decompressed_offset
                })
                .ok_or_else(|| {
                    Error::InvalidIndex(format!(
                        "no xz block starts at {:#x}",
                        checkpoint.compressed_offset
                    ))
                })?
        };
        Ok(Box::new(BlockXz {
            source,
            blocks,
            next,
            current: None,
            position: checkpoint.decompressed_offset,
            resume: checkpoint.clone(),
        }))
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Size of a block's check field for a check type.
fn check_size(check: u8) -> u64 {
    match check {
        0 => 0,
        t => 4 << ((t - 1) / 3),
    }
}

fn align4(n: u64) -> u64 {
    n.div_ceil(4) * 4
}

/// Little-endian field reader over a header or index.
struct Fields<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn byte(&mut self) -> io::Result<u8> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| invalid("xz header field past its end"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn varint(&mut self) -> io::Result<u64> {
        let mut value = 0u64;
        for i in 0..9 {
            let byte = self.byte()?;
            value |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                if byte == 0 && i > 0 {
                    return Err(invalid("xz integer is not minimally encoded"));
                }
                return Ok(value);
            }
        }
        Err(invalid("xz integer longer than nine bytes"))
    }
}

/// One block as listed in a stream index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockEntry {
    /// Source offset of the block header.
    offset: u64,
    /// Header, compressed data and check, without padding.
    unpadded: u64,
    decoded_offset: u64,
    decoded_len: u64,
    check: u8,
}

/// Lists every block of every stream in the file, in order.
fn read_layout(source: &dyn ByteSource) -> io::Result<Vec<BlockEntry>> {
    let mut streams = Vec::new();
    let mut end = source.len();
    while end > 0 {
        // Stream padding comes in zeroed groups of four.
        while end >= 4 && source.read_vec_at(end - 4, 4)? == [0, 0, 0, 0] {
            end -= 4;
        }
        if end == 0 {
            break;
        }
        if end < STREAM_HEADER_SIZE + STREAM_FOOTER_SIZE {
            return Err(invalid("xz file too short for a stream"));
        }

        let footer = source.read_vec_at(end - STREAM_FOOTER_SIZE, STREAM_FOOTER_SIZE as usize)?;
        if &footer[10..12] != FOOTER_MAGIC {
            return Err(invalid("xz stream footer not found"));
        }
        let stored = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        if crc32fast::hash(&footer[4..10]) != stored {
            return Err(invalid("xz stream footer checksum mismatch"));
        }
        let backward = (u64::from(u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]])) + 1) * 4;
        if backward > MAX_INDEX_SIZE || backward + STREAM_FOOTER_SIZE + STREAM_HEADER_SIZE > end {
            return Err(invalid("xz index size out of range"));
        }
        let check = footer[9] & 0x0F;

        let index_start = end - STREAM_FOOTER_SIZE - backward;
        let index = source.read_vec_at(index_start, backward as usize)?;
        let records = parse_index(&index)?;
        let blocks_size: u64 = records.iter().map(|&(unpadded, _)| align4(unpadded)).sum();
        let start = index_start
            .checked_sub(blocks_size + STREAM_HEADER_SIZE)
            .ok_or_else(|| invalid("xz index lists more data than the file holds"))?;

        let header = source.read_vec_at(start, STREAM_HEADER_SIZE as usize)?;
        if &header[..6] != XZ_MAGIC || header[6..8] != footer[8..10] {
            return Err(invalid("xz stream header does not match its footer"));
        }
        streams.push((start, check, records));
        end = start;
    }

    let mut blocks = Vec::new();
    let mut decoded_offset = 0u64;
    for (start, check, records) in streams.into_iter().rev() {
        let mut offset = start + STREAM_HEADER_SIZE;
        for (unpadded, decoded_len) in records {
            blocks.push(BlockEntry {
                offset,
                unpadded,
                decoded_offset,
                decoded_len,
                check,
            });
            offset += align4(unpadded);
            decoded_offset += decoded_len;
        }
    }
    Ok(blocks)
}

/// Parses an index into `(unpadded size, decoded size)` records.
fn parse_index(index: &[u8]) -> io::Result<Vec<(u64, u64)>> {
    let mut fields = Fields::new(index);
    if fields.byte()? != 0 {
        return Err(invalid("xz index indicator missing"));
    }
    let count = fields.varint()?;
    let mut records = Vec::with_capacity(count.min(index.len() as u64) as usize);
    for _ in 0..count {
        let unpadded = fields.varint()?;
        let decoded = fields.varint()?;
        if unpadded == 0 {
            return Err(invalid("xz index lists an empty block"));
        }
        records.push((unpadded, decoded));
    }
    while fields.pos % 4 != 0 {
        if fields.byte()? != 0 {
            return Err(invalid("xz index padding is not zero"));
        }
    }
    let body = fields.pos;
    let crc = index
        .get(body..body + 4)
        .ok_or_else(|| invalid("xz index checksum missing"))?;
    if crc32fast::hash(&index[..body]).to_le_bytes() != crc || body + 4 != index.len() {
        return Err(invalid("xz index checksum mismatch"));
    }
    Ok(records)
}

/// What a block header says about decoding the block.
struct BlockHeader {
    size: u64,
    dict_size: u32,
}

/// Parses the header at `block.offset`.
///
/// Returns `None` for filter chains other than a lone LZMA2.
fn read_block_header(source: &dyn ByteSource, block: &BlockEntry) -> io::Result<Option<BlockHeader>> {
    let first = source.read_vec_at(block.offset, 1)?;
    let size = match first.first() {
        Some(0) | None => return Err(invalid("xz block header missing")),
        Some(&b) => (u64::from(b) + 1) * 4,
    };
    let header = source.read_vec_at(block.offset, size as usize)?;
    if header.len() as u64 != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "xz file ends inside a block header",
        ));
    }
    let body = header.len() - 4;
    let stored = u32::from_le_bytes([header[body], header[body + 1], header[body + 2], header[body + 3]]);
    if crc32fast::hash(&header[..body]) != stored {
        return Err(invalid("xz block header checksum mismatch"));
    }

    let mut fields = Fields::new(&header[..body]);
    fields.byte()?;
    let flags = fields.byte()?;
    if flags & 0x3C != 0 {
        return Err(invalid("reserved xz block flags are set"));
    }
    if flags & 0x40 != 0 {
        fields.varint()?;
    }
    if flags & 0x80 != 0 {
        fields.varint()?;
    }
    let filters = (flags & 0x03) + 1;
    let id = fields.varint()?;
    let props_len = fields.varint()?;
    if filters != 1 || id != LZMA2_FILTER || props_len != 1 {
        return Ok(None);
    }
    let bits = fields.byte()? & 0x3F;
    let dict_size = match bits {
        0..=39 => (2 | u32::from(bits & 1)) << (bits / 2 + 11),
        40 => u32::MAX,
        _ => return Err(invalid("xz dictionary size out of range")),
    };
    Ok(Some(BlockHeader { size, dict_size }))
}

fn starts_with_plain_lzma2(source: &dyn ByteSource, blocks: &[BlockEntry]) -> Result<bool> {
    match blocks.first() {
        None => Ok(true),
        Some(first) => Ok(read_block_header(source, first)
            .map_err(|e| Error::from_decode(e, 0))?
            .is_some()),
    }
}

enum BlockCheck {
    None,
    Crc32(crc32fast::Hasher),
    Crc64(crc64fast::Digest),
    Sha256(Sha256),
    /// Reserved check types are skipped unverified.
    Unknown,
}

impl BlockCheck {
    fn new(check: u8) -> Self {
        match check {
            CHECK_NONE => Self::None,
            CHECK_CRC32 => Self::Crc32(crc32fast::Hasher::new()),
            CHECK_CRC64 => Self::Crc64(crc64fast::Digest::new()),
            CHECK_SHA256 => Self::Sha256(Sha256::new()),
            _ => Self::Unknown,
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Crc32(h) => h.update(data),
            Self::Crc64(h) => h.write(data),
            Self::Sha256(h) => h.update(data),
            Self::None | Self::Unknown => {}
        }
    }

    fn matches(self, stored: &[u8]) -> bool {
        match self {
            Self::Crc32(h) => h.finalize().to_le_bytes() == stored,
            Self::Crc64(h) => h.sum64().to_le_bytes() == stored,
            Self::Sha256(h) => h.finalize().as_slice() == stored,
            Self::None | Self::Unknown => true,
        }
    }
}

type BlockInput = io::Take<BufReader<SourceReader>>;

struct OpenBlock {
    reader: Lzma2Reader<BlockInput>,
    remaining: u64,
    check: BlockCheck,
    /// Source offset of the stored check.
    check_offset: u64,
    check_type: u8,
}

/// Decodes block by block, resuming at any block start.
struct BlockXz {
    source: Arc<dyn ByteSource>,
    blocks: Vec<BlockEntry>,
    next: usize,
    current: Option<OpenBlock>,
    position: u64,
    resume: Checkpoint,
}

impl BlockXz {
    fn open_block(&mut self, i: usize) -> io::Result<()> {
        let block = self.blocks[i];
        let header = read_block_header(&*self.source, &block)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "xz block uses a filter chain other than LZMA2",
            )
        })?;
        let compressed = block
            .unpadded
            .checked_sub(header.size + check_size(block.check))
            .filter(|&n| n > 0)
            .ok_or_else(|| invalid("xz block is smaller than its header"))?;

        if block.decoded_offset > self.resume.decompressed_offset {
            self.resume = Checkpoint::at(block.offset, block.decoded_offset);
        }

        let data = block.offset + header.size;
        let input = BufReader::with_capacity(
            READ_BUFFER_SIZE,
            SourceReader::new(Arc::clone(&self.source), data),
        )
        .take(compressed);
        self.current = Some(OpenBlock {
            reader: Lzma2Reader::new(input, header.dict_size, None),
            remaining: block.decoded_len,
            check: BlockCheck::new(block.check),
            check_offset: block.offset + align4(header.size + compressed),
            check_type: block.check,
        });
        Ok(())
    }

    fn finish_block(&mut self, block: OpenBlock) -> io::Result<()> {
        let size = check_size(block.check_type) as usize;
        let stored = self.source.read_vec_at(block.check_offset, size)?;
        if stored.len() != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "xz file ends inside a block check",
            ));
        }
        if !block.check.matches(&stored) {
            return Err(invalid("xz block check mismatch"));
        }
        Ok(())
    }
}

impl Read for BlockXz {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(block) = &mut self.current {
                if block.remaining == 0 {
                    if let Some(done) = self.current.take() {
                        self.finish_block(done)?;
                    }
                    continue;
                }
                let want = (block.remaining.min(buf.len() as u64)) as usize;
                let n = block.reader.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "xz block ended before its indexed size",
                    ));
                }
                block.remaining -= n as u64;
                block.check.update(&buf[..n]);
                self.position += n as u64;
                return Ok(n);
            }
            if self.next == self.blocks.len() {
                return Ok(0);
            }
            self.open_block(self.next)?;
            self.next += 1;
        }
    }
}

impl StreamDecoder for BlockXz {
    fn position(&self) -> u64 {
        self.position
    }

    fn snapshot_state(&self) -> Checkpoint {
        self.resume.clone()
    }
}

/// Whole-file decoding for files without a usable index.
struct SequentialXz {
    inner: XzReader<BufReader<SourceReader>>,
    position: u64,
}

impl Read for SequentialXz {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl StreamDecoder for SequentialXz {
    fn position(&self) -> u64 {
        self.position
    }

    fn snapshot_state(&self) -> Checkpoint {
        Checkpoint::origin()
    }
}
