//! Identity codec (no compression).

use std::io::{self, Read};
use std::sync::Arc;

use super::{Codec, CodecKind, StreamDecoder};
use crate::Result;
use crate::checkpoint::Checkpoint;
use crate::io::ByteSource;

/// The identity codec. Every byte is a resume point.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Identity
    }

    fn frames_independently_decodable(&self) -> bool {
        true
    }

    fn random_access(&self) -> bool {
        true
    }

    fn decode_from(
        &self,
        source: Arc<dyn ByteSource>,
        checkpoint: &Checkpoint,
    ) -> Result<Box<dyn StreamDecoder>> {
        Ok(Box::new(IdentityDecoder {
            source,
            pos: checkpoint.decompressed_offset,
        }))
    }
}

/// A decoder that passes data through unchanged.
struct IdentityDecoder {
    source: Arc<dyn ByteSource>,
    pos: u64,
}

impl Read for IdentityDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl StreamDecoder for IdentityDecoder {
    fn position(&self) -> u64 {
        self.pos
    }

    fn snapshot_state(&self) -> Checkpoint {
        Checkpoint::at(self.pos, self.pos)
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let available = self.source.len().saturating_sub(self.pos);
        let skipped = n.min(available);
        self.pos += skipped;
        Ok(skipped)
    }
}
