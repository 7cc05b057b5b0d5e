//! Zstandard codec.
//!
//! Each frame is a resume point. Seekable-format archives and the output
//! of `zstd -T0 --rsyncable` contain many frames.
//!
//! Blocks inside a frame refer back into a window of up to the frame's
//! window size, and libzstd offers no way to restore one, so a stream
//! written as a single frame only resumes at its start.

use std::io;
use std::sync::Arc;

use zstd::stream::read::Decoder;

use super::member::{self, MemberFormat, MemberInput};
use super::{Codec, CodecKind, StreamDecoder};
use crate::Result;
use crate::checkpoint::Checkpoint;
use crate::io::ByteSource;

/// The Zstandard codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdCodec;

struct ZstdFrame;

impl MemberFormat for ZstdFrame {
    const NAME: &'static str = "zstd";
    const MAGIC: &'static [u8] = &[0x28, 0xB5, 0x2F, 0xFD];
    type Decoder = Decoder<'static, MemberInput>;

    fn open(input: MemberInput) -> io::Result<Self::Decoder> {
        Ok(Decoder::with_buffer(input)?.single_frame())
    }

    fn finish(decoder: Self::Decoder) -> MemberInput {
        decoder.finish()
    }
}

impl Codec for ZstdCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Zstd
    }

    fn frames_independently_decodable(&self) -> bool {
        true
    }

    fn decode_from(
        &self,
        source: Arc<dyn ByteSource>,
        checkpoint: &Checkpoint,
    ) -> Result<Box<dyn StreamDecoder>> {
        member::decode_from::<ZstdFrame>(source, checkpoint)
    }
}
