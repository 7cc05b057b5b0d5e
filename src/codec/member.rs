//! Streams made of concatenated, self-contained members.
//!
//! zstd frames decode without any state from the previous frame, and a
//! frame decoder that reads through `BufRead` stops exactly at the frame's
//! last byte. [`MemberStream`] chains members and records every boundary it crosses as
//! a resume point.

use std::io::{self, BufReader, Read};
use std::marker::PhantomData;
use std::sync::Arc;

use super::StreamDecoder;
use crate::checkpoint::Checkpoint;
use crate::io::{ByteSource, CountingReader, SourceReader};
use crate::{Error, READ_BUFFER_SIZE, Result};

/// Compressed input handed from one member decoder to the next.
pub(crate) type MemberInput = CountingReader<BufReader<SourceReader>>;

/// One member-based compression format.
pub(crate) trait MemberFormat: Send + 'static {
    /// Human-readable format name.
    const NAME: &'static str;
    /// Bytes every member starts with.
    const MAGIC: &'static [u8];
    /// Decoder for a single member.
    type Decoder: Read + Send;

    /// Starts decoding one member.
    fn open(input: MemberInput) -> io::Result<Self::Decoder>;

    /// Returns the input, positioned just past the finished member.
    fn finish(decoder: Self::Decoder) -> MemberInput;
}

enum State<D> {
    Between(MemberInput),
    InMember(D),
    Done,
    Failed,
}

/// A decoder that walks consecutive members of format `F`.
pub(crate) struct MemberStream<F: MemberFormat> {
    source: Arc<dyn ByteSource>,
    state: State<F::Decoder>,
    position: u64,
    resume: Checkpoint,
    _format: PhantomData<F>,
}

/// Opens a member stream at `checkpoint`.
///
/// A checkpoint must sit on a member boundary. At the origin a member is
/// required; elsewhere the boundary may also be the end of the stream.
pub(crate) fn decode_from<F: MemberFormat>(
    source: Arc<dyn ByteSource>,
    checkpoint: &Checkpoint,
) -> Result<Box<dyn StreamDecoder>> {
    let offset = checkpoint.compressed_offset;
    if offset == 0 && !has_magic::<F>(&*source, 0)? {
        return Err(Error::corrupt(0, format!("not a {} stream", F::NAME)));
    }
    let reader = SourceReader::new(Arc::clone(&source), offset);
    let input = CountingReader::new(BufReader::with_capacity(READ_BUFFER_SIZE, reader), offset);
    Ok(Box::new(MemberStream::<F> {
        source,
        state: State::Between(input),
        position: checkpoint.decompressed_offset,
        resume: checkpoint.clone(),
        _format: PhantomData,
    }))
}

fn has_magic<F: MemberFormat>(source: &dyn ByteSource, offset: u64) -> io::Result<bool> {
    let head = source.read_vec_at(offset, F::MAGIC.len())?;
    Ok(head == F::MAGIC)
}

impl<F: MemberFormat> Read for MemberStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match std::mem::replace(&mut self.state, State::Failed) {
                State::InMember(mut decoder) => {
                    let n = decoder.read(buf)?;
                    if n > 0 {
                        self.position += n as u64;
                        self.state = State::InMember(decoder);
                        return Ok(n);
                    }
                    let input = F::finish(decoder);
                    self.resume = Checkpoint::at(input.offset(), self.position);
                    self.state = State::Between(input);
                }
                State::Between(input) => {
                    // Anything that does not start like a member is trailing padding.
                    if !has_magic::<F>(&*self.source, input.offset())? {
                        self.state = State::Done;
                        return Ok(0);
                    }
                    self.state = State::InMember(F::open(input)?);
                }
                State::Done => {
                    self.state = State::Done;
                    return Ok(0);
                }
                State::Failed => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} decoder failed earlier in this stream", F::NAME),
                    ));
                }
            }
        }
    }
}

impl<F: MemberFormat> StreamDecoder for MemberStream<F> {
    fn position(&self) -> u64 {
        self.position
    }

    fn snapshot_state(&self) -> Checkpoint {
        self.resume.clone()
    }
}
