//! Codec capability contract.
//!
//! The engine never looks inside a compressed format. It only needs each
//! codec to open a decoder at the start of a stream, reopen one at a saved
//! [`Checkpoint`], report the latest position it could be resumed from, and
//! say whether those positions can be decoded independently of each other.
//!
//! | Codec | Resume points | Independent frames |
//! |-------|---------------|--------------------|
//! | identity | every byte | yes |
//! | gzip | member boundaries, deflate block boundaries | yes |
//! | bzip2 | stream boundaries, block boundaries | yes |
//! | zstd | frame boundaries | yes |
//! | xz | block boundaries from the stream index | yes |
//!
//! A zstd stream written as a single frame has no resume point past its
//! start; reads into it decode forward from the origin or from a pooled
//! decoder.

mod copy;

#[cfg(feature = "zstd")]
mod member;

#[cfg(feature = "gzip")]
mod gzip;

#[cfg(feature = "bzip2")]
mod bzip2;

#[cfg(feature = "zstd")]
mod zstd;

#[cfg(feature = "xz")]
mod xz;

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::io::ByteSource;
use crate::{Error, READ_BUFFER_SIZE, Result};

pub use copy::IdentityCodec;

#[cfg(feature = "gzip")]
pub use gzip::GzipCodec;

#[cfg(feature = "bzip2")]
pub use self::bzip2::Bzip2Codec;

#[cfg(feature = "zstd")]
pub use self::zstd::ZstdCodec;

#[cfg(feature = "xz")]
pub use xz::XzCodec;

/// The compression formats the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// No compression.
    Identity,
    /// gzip (RFC 1952), possibly multi-member.
    Gzip,
    /// bzip2, possibly multi-stream.
    Bzip2,
    /// xz.
    Xz,
    /// Zstandard, possibly multi-frame.
    Zstd,
}

impl CodecKind {
    /// Stable name used in persisted indexes.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }

    /// Parses a name produced by [`name`](Self::name).
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "identity" => Self::Identity,
            "gzip" => Self::Gzip,
            "bzip2" => Self::Bzip2,
            "xz" => Self::Xz,
            "zstd" => Self::Zstd,
            _ => return None,
        })
    }

    /// File name suffixes that indicate this codec, longest first.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Identity => &[],
            Self::Gzip => &[".gz", ".gzip"],
            Self::Bzip2 => &[".bz2", ".bzip2"],
            Self::Xz => &[".xz"],
            Self::Zstd => &[".zst", ".zstd"],
        }
    }

    /// Returns the codec implementation, if this build includes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFormat`] if the codec's feature is disabled.
    pub fn codec(&self) -> Result<Arc<dyn Codec>> {
        match self {
            Self::Identity => Ok(Arc::new(IdentityCodec)),
            #[cfg(feature = "gzip")]
            Self::Gzip => Ok(Arc::new(GzipCodec)),
            #[cfg(feature = "bzip2")]
            Self::Bzip2 => Ok(Arc::new(Bzip2Codec)),
            #[cfg(feature = "zstd")]
            Self::Zstd => Ok(Arc::new(ZstdCodec)),
            #[cfg(feature = "xz")]
            Self::Xz => Ok(Arc::new(XzCodec)),
            #[allow(unreachable_patterns)]
            other => Err(Error::UnsupportedFormat(format!(
                "{} support is not enabled in this build",
                other.name()
            ))),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A live decoder over one compressed stream.
pub trait StreamDecoder: Read + Send {
    /// Decoded offset of the next byte `read` will return.
    fn position(&self) -> u64;

    /// The latest position this decoder could be resumed from.
    ///
    /// The returned checkpoint's decoded offset is never past
    /// [`position`](Self::position).
    fn snapshot_state(&self) -> Checkpoint;

    /// Asks the decoder to keep resume points at least `spacing` decoded
    /// bytes apart.
    ///
    /// Codecs whose resume points are costly to capture use this to skip
    /// boundaries that would be discarded anyway. Boundaries that cost
    /// nothing may still be reported more often.
    fn set_resume_spacing(&mut self, _spacing: u64) {}

    /// Discards up to `n` decoded bytes and returns how many were skipped.
    ///
    /// Fewer than `n` means the stream ended.
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut remaining = n;
        let mut buf = [0u8; READ_BUFFER_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            match self.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(read) => remaining -= read as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(n - remaining)
    }
}

impl fmt::Debug for dyn StreamDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

/// A compression format's capabilities.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Which format this is.
    fn kind(&self) -> CodecKind;

    /// True if decoding can start at any checkpoint without decoding earlier data.
    fn frames_independently_decodable(&self) -> bool;

    /// True if any decoded offset can be opened directly.
    ///
    /// Only the identity codec has this property; readers skip checkpoint
    /// bookkeeping for it.
    fn random_access(&self) -> bool {
        false
    }

    /// Opens a decoder at `checkpoint`.
    fn decode_from(
        &self,
        source: Arc<dyn ByteSource>,
        checkpoint: &Checkpoint,
    ) -> Result<Box<dyn StreamDecoder>>;

    /// Opens a decoder at the start of the stream.
    fn open_decoder(&self, source: Arc<dyn ByteSource>) -> Result<Box<dyn StreamDecoder>> {
        self.decode_from(source, &Checkpoint::origin())
    }
}

/// Reads into `buf` until it is full or the stream ends.
pub(crate) fn read_full(decoder: &mut dyn StreamDecoder, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match decoder.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
