//! Archive format detection.
//!
//! Formats are recognized by their magic bytes first and by file name
//! extension as a fallback. Uncompressed tar has no magic at offset 0, so a
//! head that matches no signature is also checked for a tar header (the
//! `ustar` magic at offset 257, or a valid header checksum for pre-POSIX
//! archives).

use std::fmt;

use crate::codec::CodecKind;

/// Bytes of the head a caller should pass to [`detect_signature`].
pub const SNIFF_LEN: usize = 512;

/// Detected archive format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// Uncompressed tar.
    Tar,
    /// ZIP archive.
    Zip,
    /// 7z archive.
    SevenZip,
    /// RAR archive (v4).
    Rar,
    /// RAR5 archive (v5+).
    Rar5,
    /// gzip compressed stream.
    Gzip,
    /// bzip2 compressed stream.
    Bzip2,
    /// XZ compressed stream.
    Xz,
    /// Zstandard compressed stream.
    Zstd,
    /// SquashFS image.
    SquashFs,
    /// Unknown or unrecognized format.
    Unknown,
}

impl ArchiveFormat {
    /// Returns the typical file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::Rar | ArchiveFormat::Rar5 => "rar",
            ArchiveFormat::Gzip => "gz",
            ArchiveFormat::Bzip2 => "bz2",
            ArchiveFormat::Xz => "xz",
            ArchiveFormat::Zstd => "zst",
            ArchiveFormat::SquashFs => "squashfs",
            ArchiveFormat::Unknown => "",
        }
    }

    /// Returns a human-readable name for this format.
    pub fn name(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "TAR",
            ArchiveFormat::Zip => "ZIP",
            ArchiveFormat::SevenZip => "7-Zip",
            ArchiveFormat::Rar => "RAR",
            ArchiveFormat::Rar5 => "RAR5",
            ArchiveFormat::Gzip => "gzip",
            ArchiveFormat::Bzip2 => "bzip2",
            ArchiveFormat::Xz => "XZ",
            ArchiveFormat::Zstd => "Zstandard",
            ArchiveFormat::SquashFs => "SquashFS",
            ArchiveFormat::Unknown => "Unknown",
        }
    }

    /// The codec of a compressed stream format.
    pub fn codec(&self) -> Option<CodecKind> {
        match self {
            ArchiveFormat::Gzip => Some(CodecKind::Gzip),
            ArchiveFormat::Bzip2 => Some(CodecKind::Bzip2),
            ArchiveFormat::Xz => Some(CodecKind::Xz),
            ArchiveFormat::Zstd => Some(CodecKind::Zstd),
            _ => None,
        }
    }

    /// Returns whether this build has a backend for the format.
    pub fn is_supported(&self) -> bool {
        match self {
            ArchiveFormat::Tar | ArchiveFormat::Zip | ArchiveFormat::SquashFs => true,
            ArchiveFormat::SevenZip
            | ArchiveFormat::Rar
            | ArchiveFormat::Rar5
            | ArchiveFormat::Unknown => false,
            other => other.codec().is_some_and(|kind| kind.codec().is_ok()),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Known archive format signatures.
const SIGNATURES: &[(&[u8], ArchiveFormat)] = &[
    // 7z: '7' 'z' 0xBC 0xAF 0x27 0x1C
    (
        &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C],
        ArchiveFormat::SevenZip,
    ),
    // ZIP: 'P' 'K' 0x03 0x04 (local file header)
    (&[0x50, 0x4B, 0x03, 0x04], ArchiveFormat::Zip),
    // ZIP: 'P' 'K' 0x05 0x06 (empty archive)
    (&[0x50, 0x4B, 0x05, 0x06], ArchiveFormat::Zip),
    // RAR: 'R' 'a' 'r' '!' 0x1A 0x07 0x00
    (
        &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00],
        ArchiveFormat::Rar,
    ),
    // RAR5: 'R' 'a' 'r' '!' 0x1A 0x07 0x01 0x00
    (
        &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x01, 0x00],
        ArchiveFormat::Rar5,
    ),
    // gzip: 0x1F 0x8B
    (&[0x1F, 0x8B], ArchiveFormat::Gzip),
    // XZ: 0xFD '7' 'z' 'X' 'Z' 0x00
    (&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], ArchiveFormat::Xz),
    // bzip2: 'B' 'Z' 'h'
    (&[0x42, 0x5A, 0x68], ArchiveFormat::Bzip2),
    // Zstd: 0x28 0xB5 0x2F 0xFD
    (&[0x28, 0xB5, 0x2F, 0xFD], ArchiveFormat::Zstd),
    // SquashFS v4 superblock: "hsqs"
    (b"hsqs", ArchiveFormat::SquashFs),
];

/// Detects the format from the first bytes of a file.
///
/// ```rust
/// use seekstone::detect::{ArchiveFormat, detect_signature};
///
/// assert_eq!(detect_signature(&[0x1F, 0x8B, 0x08, 0x00]), ArchiveFormat::Gzip);
/// assert_eq!(detect_signature(b"plain text"), ArchiveFormat::Unknown);
/// ```
pub fn detect_signature(head: &[u8]) -> ArchiveFormat {
    for (signature, format) in SIGNATURES {
        if head.starts_with(signature) {
            return *format;
        }
    }
    if is_tar_head(head) {
        return ArchiveFormat::Tar;
    }
    ArchiveFormat::Unknown
}

/// Returns true if `head` starts with a plausible tar header.
pub fn is_tar_head(head: &[u8]) -> bool {
    head.get(..crate::tar::BLOCK_SIZE)
        .is_some_and(crate::tar::looks_like_header)
}

/// Detects the format from a file name.
///
/// Combined suffixes such as `.tar.gz` report the outer compression format.
///
/// ```rust
/// use seekstone::detect::{ArchiveFormat, detect_extension};
///
/// assert_eq!(detect_extension("logs.tar.zst"), ArchiveFormat::Zstd);
/// assert_eq!(detect_extension("photos.ZIP"), ArchiveFormat::Zip);
/// assert_eq!(detect_extension("notes.txt"), ArchiveFormat::Unknown);
/// ```
pub fn detect_extension(name: &str) -> ArchiveFormat {
    let Some((_, extension)) = name.rsplit_once('.') else {
        return ArchiveFormat::Unknown;
    };
    match extension.to_ascii_lowercase().as_str() {
        "tar" => ArchiveFormat::Tar,
        "zip" | "jar" | "war" | "apk" => ArchiveFormat::Zip,
        "7z" => ArchiveFormat::SevenZip,
        "rar" => ArchiveFormat::Rar,
        "gz" | "gzip" | "tgz" => ArchiveFormat::Gzip,
        "bz2" | "bzip2" | "tbz" | "tbz2" => ArchiveFormat::Bzip2,
        "xz" | "txz" => ArchiveFormat::Xz,
        "zst" | "zstd" | "tzst" => ArchiveFormat::Zstd,
        "squashfs" | "sqsh" | "sqfs" => ArchiveFormat::SquashFs,
        _ => ArchiveFormat::Unknown,
    }
}

/// Detects by signature, falling back to the name.
pub fn detect(head: &[u8], name: &str) -> ArchiveFormat {
    match detect_signature(head) {
        ArchiveFormat::Unknown => detect_extension(name),
        format => format,
    }
}

/// Name of the decoded file inside a single compressed file.
///
/// ```rust
/// use seekstone::detect::strip_compression_extension;
///
/// assert_eq!(strip_compression_extension("data.csv.gz"), "data.csv");
/// assert_eq!(strip_compression_extension("backup.tgz"), "backup.tar");
/// assert_eq!(strip_compression_extension("README"), "README");
/// ```
pub fn strip_compression_extension(name: &str) -> String {
    let Some((stem, extension)) = name.rsplit_once('.') else {
        return name.to_string();
    };
    if stem.is_empty() {
        return name.to_string();
    }
    match extension.to_ascii_lowercase().as_str() {
        "tgz" | "tbz" | "tbz2" | "txz" | "tzst" => format!("{stem}.tar"),
        "gz" | "gzip" | "bz2" | "bzip2" | "xz" | "zst" | "zstd" => stem.to_string(),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_signatures() {
        let cases: &[(&[u8], ArchiveFormat)] = &[
            (&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00], ArchiveFormat::SevenZip),
            (&[0x50, 0x4B, 0x03, 0x04, 0x14], ArchiveFormat::Zip),
            (&[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00], ArchiveFormat::Rar),
            (&[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x01, 0x00], ArchiveFormat::Rar5),
            (&[0x1F, 0x8B, 0x08], ArchiveFormat::Gzip),
            (&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], ArchiveFormat::Xz),
            (b"BZh91AY", ArchiveFormat::Bzip2),
            (&[0x28, 0xB5, 0x2F, 0xFD, 0x04], ArchiveFormat::Zstd),
            (b"hsqs\x05\x00\x00\x00", ArchiveFormat::SquashFs),
        ];
        for (head, expected) in cases {
            assert_eq!(detect_signature(head), *expected, "{head:02x?}");
        }
    }

    #[test]
    fn test_detect_tar_by_ustar_magic() {
        let mut block = vec![0u8; 512];
        block[..5].copy_from_slice(b"a.txt");
        block[257..263].copy_from_slice(b"ustar\0");
        assert_eq!(detect_signature(&block), ArchiveFormat::Tar);
    }

    #[test]
    fn test_short_head_is_not_tar() {
        assert_eq!(detect_signature(b"ustar"), ArchiveFormat::Unknown);
        assert_eq!(detect_signature(&[]), ArchiveFormat::Unknown);
        assert_eq!(detect_signature(&[0u8; 512]), ArchiveFormat::Unknown);
    }

    #[test]
    fn test_detect_extension() {
        assert_eq!(detect_extension("a.tar"), ArchiveFormat::Tar);
        assert_eq!(detect_extension("a.tgz"), ArchiveFormat::Gzip);
        assert_eq!(detect_extension("a.tar.bz2"), ArchiveFormat::Bzip2);
        assert_eq!(detect_extension("a.TXZ"), ArchiveFormat::Xz);
        assert_eq!(detect_extension("a.rar"), ArchiveFormat::Rar);
        assert_eq!(detect_extension("root.sqfs"), ArchiveFormat::SquashFs);
        assert_eq!(detect_extension("tar"), ArchiveFormat::Unknown);
    }

    #[test]
    fn test_detect_prefers_signature() {
        assert_eq!(detect(&[0x1F, 0x8B], "a.zip"), ArchiveFormat::Gzip);
        assert_eq!(detect(b"??", "a.zip"), ArchiveFormat::Zip);
    }

    #[test]
    fn test_strip_compression_extension() {
        assert_eq!(strip_compression_extension("a.tar.gz"), "a.tar");
        assert_eq!(strip_compression_extension("a.txz"), "a.tar");
        assert_eq!(strip_compression_extension("x.zst"), "x");
        assert_eq!(strip_compression_extension(".gz"), ".gz");
        assert_eq!(strip_compression_extension("a.zip"), "a.zip");
    }

    #[test]
    fn test_supported_formats() {
        assert!(ArchiveFormat::Tar.is_supported());
        assert!(ArchiveFormat::Zip.is_supported());
        assert!(ArchiveFormat::SquashFs.is_supported());
        assert_eq!(ArchiveFormat::SquashFs.codec(), None);
        assert!(!ArchiveFormat::SevenZip.is_supported());
        assert!(!ArchiveFormat::Rar5.is_supported());
        assert_eq!(ArchiveFormat::Zstd.codec(), Some(CodecKind::Zstd));
    }
}
