//! gzip codec.
//!
//! Every member of a multi-member gzip file (as written by `pigz`, `bgzip`
//! or plain concatenation) is a resume point. Inside a member, decoding can
//! also restart at a deflate block boundary: the inflater is primed with the
//! bits of the boundary byte it had not consumed yet and given the 32 KiB of
//! output before the boundary as its dictionary. Those seek points are
//! captured at most once per resume spacing.
//!
//! Members are inflated raw, so headers and trailers are parsed here. A
//! member decoded from its header has its CRC-32 and length checked against
//! the trailer.

use std::ffi::{c_int, c_uint};
use std::io::{self, Read};
use std::sync::Arc;

use libz_rs_sys::{
    inflate, inflateEnd, inflateGetDictionary, inflateInit2_, inflatePrime, inflateReset,
    inflateSetDictionary, z_stream, zlibVersion,
};

use super::{Codec, CodecKind, StreamDecoder};
use crate::checkpoint::{Checkpoint, CodecState};
use crate::io::ByteSource;
use crate::{Error, READ_BUFFER_SIZE, Result};

const MAGIC: [u8; 2] = [0x1F, 0x8B];
const DEFLATE: u8 = 8;
const WINDOW_SIZE: usize = 32 * 1024;

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = 0xE0;

const Z_OK: c_int = 0;
const Z_STREAM_END: c_int = 1;
const Z_NEED_DICT: c_int = 2;
const Z_BUF_ERROR: c_int = -5;
const Z_BLOCK: c_int = 5;

/// The gzip codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCodec;

impl Codec for GzipCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Gzip
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
        if offset == 0 && source.read_vec_at(0, MAGIC.len())? != MAGIC {
            return Err(Error::corrupt(0, "not a gzip stream"));
        }

        let mut inflater = Inflater::new()?;
        let phase = match checkpoint.state.as_bytes().split_first() {
            None => Phase::Header,
            Some((&bits, window)) => {
                if bits > 7 || window.len() > WINDOW_SIZE || (bits > 0 && offset == 0) {
                    return Err(Error::InvalidIndex(format!(
                        "malformed gzip seek point at {offset:#x}"
                    )));
                }
                if bits > 0 {
                    let byte = source.read_vec_at(offset - 1, 1)?;
                    let Some(&byte) = byte.first() else {
                        return Err(Error::truncated(offset, "gzip seek point past the end"));
                    };
                    inflater.prime(bits, byte >> (8 - bits))?;
                }
                inflater.set_dictionary(window)?;
                Phase::Deflate
            }
        };

        Ok(Box::new(GzipDecoder {
            input: Input::new(source, offset),
            inflater,
            phase,
            position: checkpoint.decompressed_offset,
            check: None,
            resume: checkpoint.clone(),
            spacing: u64::MAX,
        }))
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn truncated(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, message)
}

fn check(ret: c_int, call: &str) -> io::Result<()> {
    if ret == Z_OK {
        Ok(())
    } else {
        Err(io::Error::other(format!("{call} failed with zlib code {ret}")))
    }
}

/// One call's worth of inflate progress.
struct Inflated {
    consumed: usize,
    produced: usize,
    /// The member's deflate data ended.
    finished: bool,
    /// Unused bits of the last consumed byte, when stopped at a block boundary.
    boundary: Option<u8>,
}

/// A raw deflate stream.
struct Inflater {
    // Boxed: zlib checks that the stream never moves after init.
    stream: Box<z_stream>,
}

// SAFETY: the stream and the state it points to belong to this value alone
// and are only touched through `&mut self`.
unsafe impl Send for Inflater {}

impl Inflater {
    fn new() -> io::Result<Self> {
        let mut stream = Box::new(z_stream::default());
        // SAFETY: `stream` is a zeroed z_stream at a stable address; negative
        // window bits select raw deflate with a 32 KiB window.
        let ret = unsafe {
            inflateInit2_(
                &mut *stream,
                -15,
                zlibVersion(),
                std::mem::size_of::<z_stream>() as c_int,
            )
        };
        check(ret, "inflateInit2")?;
        Ok(Self { stream })
    }

    fn reset(&mut self) -> io::Result<()> {
        // SAFETY: the stream was initialized in `new`.
        check(unsafe { inflateReset(&mut *self.stream) }, "inflateReset")
    }

    fn prime(&mut self, bits: u8, value: u8) -> io::Result<()> {
        // SAFETY: the stream was initialized in `new`.
        let ret = unsafe {
            inflatePrime(&mut *self.stream, c_int::from(bits), c_int::from(value))
        };
        check(ret, "inflatePrime")
    }

    fn set_dictionary(&mut self, window: &[u8]) -> io::Result<()> {
        if window.is_empty() {
            return Ok(());
        }
        // SAFETY: `window` is valid for `window.len()` bytes, at most 32 KiB.
        let ret = unsafe {
            inflateSetDictionary(&mut *self.stream, window.as_ptr(), window.len() as c_uint)
        };
        check(ret, "inflateSetDictionary")
    }

    /// The decoded bytes the next block may refer back to.
    fn window(&mut self) -> io::Result<Vec<u8>> {
        let mut window = vec![0u8; WINDOW_SIZE];
        let mut len: c_uint = 0;
        // SAFETY: a raw stream with 15 window bits keeps at most 32 KiB.
        let ret = unsafe {
            inflateGetDictionary(&mut *self.stream, window.as_mut_ptr(), &mut len)
        };
        check(ret, "inflateGetDictionary")?;
        window.truncate(len as usize);
        Ok(window)
    }

    /// Inflates until `output` is full, `input` runs out, or a block ends.
    fn inflate(&mut self, input: &[u8], output: &mut [u8]) -> io::Result<Inflated> {
        let stream = &mut *self.stream;
        let avail_in = input.len().min(c_uint::MAX as usize) as c_uint;
        let avail_out = output.len().min(c_uint::MAX as usize) as c_uint;
        stream.next_in = input.as_ptr();
        stream.avail_in = avail_in;
        stream.next_out = output.as_mut_ptr();
        stream.avail_out = avail_out;
        // SAFETY: both buffers outlive the call and the lengths match them.
        let ret = unsafe { inflate(&mut *stream, Z_BLOCK) };
        let consumed = (avail_in - stream.avail_in) as usize;
        let produced = (avail_out - stream.avail_out) as usize;
        stream.next_in = std::ptr::null();
        stream.avail_in = 0;
        stream.next_out = std::ptr::null_mut();
        stream.avail_out = 0;

        match ret {
            Z_OK | Z_BUF_ERROR => {}
            Z_STREAM_END => {
                return Ok(Inflated {
                    consumed,
                    produced,
                    finished: true,
                    boundary: None,
                });
            }
            Z_NEED_DICT => return Err(invalid("deflate data asks for a preset dictionary")),
            code => return Err(invalid(format!("invalid deflate data (zlib code {code})"))),
        }
        // 128: stopped right after an end-of-block code; 64: inside the last block.
        let data_type = stream.data_type;
        let boundary = (data_type & 128 != 0 && data_type & 64 == 0).then_some((data_type & 7) as u8);
        Ok(Inflated {
            consumed,
            produced,
            finished: false,
            boundary,
        })
    }
}

impl Drop for Inflater {
    fn drop(&mut self) {
        // SAFETY: the stream was initialized in `new` and is ended once.
        unsafe {
            inflateEnd(&mut *self.stream);
        }
    }
}

/// Compressed bytes read ahead from the source.
struct Input {
    source: Arc<dyn ByteSource>,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    /// Source offset of `buf[0]`.
    base: u64,
}

impl Input {
    fn new(source: Arc<dyn ByteSource>, offset: u64) -> Self {
        Self {
            source,
            buf: vec![0u8; READ_BUFFER_SIZE],
            start: 0,
            end: 0,
            base: offset,
        }
    }

    /// Source offset of the next unconsumed byte.
    fn offset(&self) -> u64 {
        self.base + self.start as u64
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
    }

    /// Reads more compressed bytes. Returns false at the end of the source.
    fn fill(&mut self) -> io::Result<bool> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.base += self.start as u64;
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            return Err(invalid("inflate stalled with a full input buffer"));
        }
        loop {
            match self
                .source
                .read_at(self.base + self.end as u64, &mut self.buf[self.end..])
            {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.end += n;
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn byte(&mut self) -> io::Result<Option<u8>> {
        if self.start == self.end && !self.fill()? {
            return Ok(None);
        }
        let byte = self.buf[self.start];
        self.start += 1;
        Ok(Some(byte))
    }

    fn require(&mut self) -> io::Result<u8> {
        self.byte()?
            .ok_or_else(|| truncated("gzip stream ended inside a member header or trailer"))
    }

    fn skip(&mut self, n: usize) -> io::Result<()> {
        for _ in 0..n {
            self.require()?;
        }
        Ok(())
    }

    fn skip_cstr(&mut self) -> io::Result<()> {
        while self.require()? != 0 {}
        Ok(())
    }
}

/// Running CRC-32 and length of a member decoded from its header.
struct MemberCheck {
    hasher: crc32fast::Hasher,
    len: u32,
}

enum Phase {
    Header,
    Deflate,
    Done,
    Failed,
}

struct GzipDecoder {
    input: Input,
    inflater: Inflater,
    phase: Phase,
    position: u64,
    check: Option<MemberCheck>,
    resume: Checkpoint,
    spacing: u64,
}

impl GzipDecoder {
    /// Parses the next member header. Returns false if the stream has ended.
    fn start_member(&mut self) -> io::Result<bool> {
        let member_start = self.input.offset();
        let first = self.input.byte()?;
        let second = match first {
            Some(_) => self.input.byte()?,
            None => None,
        };
        // Anything that does not start like a member is trailing padding.
        if [first, second] != [Some(MAGIC[0]), Some(MAGIC[1])] {
            return Ok(false);
        }

        let method = self.input.require()?;
        let flags = self.input.require()?;
        if method != DEFLATE {
            return Err(invalid(format!("unsupported gzip compression method {method}")));
        }
        if flags & FRESERVED != 0 {
            return Err(invalid("reserved gzip header flags are set"));
        }
        // mtime, extra flags, operating system
        self.input.skip(6)?;
        if flags & FEXTRA != 0 {
            let len = u16::from_le_bytes([self.input.require()?, self.input.require()?]);
            self.input.skip(usize::from(len))?;
        }
        if flags & FNAME != 0 {
            self.input.skip_cstr()?;
        }
        if flags & FCOMMENT != 0 {
            self.input.skip_cstr()?;
        }
        if flags & FHCRC != 0 {
            self.input.skip(2)?;
        }

        self.inflater.reset()?;
        self.check = Some(MemberCheck {
            hasher: crc32fast::Hasher::new(),
            len: 0,
        });
        self.resume = Checkpoint::at(member_start, self.position);
        Ok(true)
    }

    fn finish_member(&mut self) -> io::Result<()> {
        let mut trailer = [0u8; 8];
        for byte in &mut trailer {
            *byte = self.input.require()?;
        }
        if let Some(check) = self.check.take() {
            let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            let len = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
            if check.hasher.finalize() != crc || check.len != len {
                return Err(invalid("gzip member checksum mismatch"));
            }
        }
        Ok(())
    }

    /// Turns the block boundary just reached into a seek point if it is far enough along.
    fn capture(&mut self, bits: u8) -> io::Result<()> {
        if self.position < self.resume.decompressed_offset.saturating_add(self.spacing) {
            return Ok(());
        }
        let window = self.inflater.window()?;
        let mut state = Vec::with_capacity(window.len() + 1);
        state.push(bits);
        state.extend_from_slice(&window);
        self.resume = Checkpoint {
            compressed_offset: self.input.offset(),
            decompressed_offset: self.position,
            state: CodecState::from_bytes(state),
        };
        Ok(())
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.phase {
                Phase::Done => return Ok(0),
                Phase::Failed => {
                    return Err(invalid("gzip decoder failed earlier in this stream"));
                }
                Phase::Header => {
                    self.phase = if self.start_member()? {
                        Phase::Deflate
                    } else {
                        Phase::Done
                    };
                }
                Phase::Deflate => {
                    if self.input.pending().is_empty() && !self.input.fill()? {
                        return Err(truncated("gzip stream ended inside deflate data"));
                    }
                    let step = self.inflater.inflate(self.input.pending(), buf)?;
                    self.input.consume(step.consumed);
                    let out = &buf[..step.produced];
                    self.position += out.len() as u64;
                    if let Some(check) = &mut self.check {
                        check.hasher.update(out);
                        check.len = check.len.wrapping_add(out.len() as u32);
                    }

                    if step.finished {
                        self.finish_member()?;
                        self.phase = Phase::Header;
                    } else if let Some(bits) = step.boundary {
                        self.capture(bits)?;
                    } else if step.consumed == 0 && step.produced == 0 && !self.input.fill()? {
                        return Err(truncated("gzip stream ended inside deflate data"));
                    }
                    if step.produced > 0 {
                        return Ok(step.produced);
                    }
                }
            }
        }
    }
}

impl Read for GzipDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let result = self.read_inner(buf);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }
}

impl StreamDecoder for GzipDecoder {
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
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::{Read, Write};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Text over a 16-letter alphabet: compressible, but without long repeats.
    fn letters(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| b'a' + rng.gen_range(0..16u8)).collect()
    }

    fn source(data: Vec<u8>) -> Arc<dyn ByteSource> {
        Arc::new(MemorySource::new(data))
    }

    #[test]
    fn test_single_member() {
        let mut decoder = GzipCodec.open_decoder(source(gzip(b"hello gzip"))).unwrap();
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello gzip");
        assert_eq!(decoder.position(), 10);
    }

    #[test]
    fn test_members_are_resume_points() {
        let first = gzip(b"first member,");
        let second = gzip(b"second member");
        let mut data = first.clone();
        data.extend_from_slice(&second);

        let mut decoder = GzipCodec.open_decoder(source(data.clone())).unwrap();
        let mut buf = vec![0u8; 13];
        decoder.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"first member,");
        // The boundary is only known once the decoder looks past it.
        let mut one = [0u8; 1];
        decoder.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"s");

        let resume = decoder.snapshot_state();
        assert_eq!(resume.compressed_offset, first.len() as u64);
        assert_eq!(resume.decompressed_offset, 13);
        assert!(resume.state.is_empty());

        let mut resumed = GzipCodec.decode_from(source(data), &resume).unwrap();
        let mut out = Vec::new();
        resumed.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"second member");
        assert_eq!(resumed.position(), 26);
    }

    #[test]
    fn test_block_boundaries_inside_one_member() {
        let data = letters(1_500_000, 11);
        let compressed = source(gzip(&data));
        let mut decoder = GzipCodec.open_decoder(Arc::clone(&compressed)).unwrap();
        decoder.set_resume_spacing(64 * 1024);

        let mut points: Vec<Checkpoint> = Vec::new();
        let mut chunk = vec![0u8; 8192];
        loop {
            let n = decoder.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            let resume = decoder.snapshot_state();
            assert!(resume.decompressed_offset <= decoder.position());
            if points.last() != Some(&resume) {
                points.push(resume);
            }
        }
        assert_eq!(decoder.position(), data.len() as u64);

        let inner: Vec<&Checkpoint> = points.iter().filter(|p| !p.state.is_empty()).collect();
        assert!(inner.len() >= 10, "only {} seek points", inner.len());
        for pair in inner.windows(2) {
            assert!(pair[1].decompressed_offset - pair[0].decompressed_offset >= 64 * 1024);
            assert!(pair[0].compressed_offset < pair[1].compressed_offset);
        }

        for point in inner.iter().rev().step_by(3) {
            let start = point.decompressed_offset as usize;
            let mut resumed = GzipCodec.decode_from(Arc::clone(&compressed), point).unwrap();
            let mut head = vec![0u8; 5000.min(data.len() - start)];
            resumed.read_exact(&mut head).unwrap();
            assert_eq!(head, &data[start..start + head.len()]);
        }

        // Resuming from the last point runs through the trailer to the end.
        let last = inner.last().unwrap();
        let mut resumed = GzipCodec.decode_from(compressed, last).unwrap();
        let mut tail = Vec::new();
        resumed.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[last.decompressed_offset as usize..]);
    }

    #[test]
    fn test_default_spacing_keeps_windows_out() {
        let data = letters(300_000, 5);
        let mut decoder = GzipCodec.open_decoder(source(gzip(&data))).unwrap();
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(decoder.snapshot_state(), Checkpoint::origin());
    }

    #[test]
    fn test_malformed_seek_point_is_rejected() {
        let compressed = source(gzip(b"payload"));
        let bad = Checkpoint {
            compressed_offset: 12,
            decompressed_offset: 3,
            state: CodecState::from_bytes(vec![9]),
        };
        let err = GzipCodec.decode_from(compressed, &bad).unwrap_err();
        assert!(matches!(err, Error::InvalidIndex(_)));
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let mut data = gzip(b"checked payload");
        let crc_at = data.len() - 8;
        data[crc_at] ^= 0xFF;
        let mut decoder = GzipCodec.open_decoder(source(data)).unwrap();
        let mut out = Vec::new();
        let err = decoder.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_trailing_padding_is_ignored() {
        let mut data = gzip(b"payload");
        data.extend_from_slice(&[0u8; 512]);
        let mut decoder = GzipCodec.open_decoder(source(data)).unwrap();
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn test_rejects_non_gzip() {
        let err = GzipCodec
            .open_decoder(source(b"plain text".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::CorruptArchive { offset: 0, .. }));
    }

    #[test]
    fn test_truncated_member_fails() {
        let data = gzip(&vec![7u8; 100_000]);
        let cut = data[..data.len() / 2].to_vec();
        let mut decoder = GzipCodec.open_decoder(source(cut)).unwrap();
        let mut out = Vec::new();
        assert!(decoder.read_to_end(&mut out).is_err());
    }
}
