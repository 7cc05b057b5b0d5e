//! ZIP archives.
//!
//! The central directory is read once at open time. Entries are extracted on
//! demand: stored entries are plain byte ranges, deflated ones are inflated
//! from their start (or from where the previous read of the same entry
//! stopped). ZIP64 sizes and offsets are supported; encryption and other
//! compression methods are reported as [`Error::UnsupportedFormat`].

use std::fmt;
use std::sync::Arc;
#[cfg(feature = "gzip")]
use std::sync::{Mutex, PoisonError};

use super::clamp_read;
use super::foreign::{ForeignArchive, ForeignEntry};
use crate::index::{EntryKind, S_IFDIR, S_IFLNK, S_IFMT};
use crate::io::ByteSource;
use crate::ownership::Ownership;
use crate::timestamp::Timestamp;
use crate::{Error, Result};

const EOCD_SIG: u32 = 0x0605_4b50;
const EOCD_LEN: usize = 22;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const ZIP64_LOCATOR_LEN: u64 = 20;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_EOCD_LEN: usize = 56;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const CENTRAL_LEN: usize = 46;
const LOCAL_SIG: u32 = 0x0403_4b50;
const LOCAL_LEN: usize = 30;
const MAX_COMMENT: usize = 0xFFFF;

const METHOD_STORED: u16 = 0;
#[cfg(feature = "gzip")]
const METHOD_DEFLATE: u16 = 8;

const FLAG_ENCRYPTED: u16 = 0x0001;
const HOST_UNIX: u16 = 3;
const DOS_READONLY: u32 = 0x01;
const DOS_DIRECTORY: u32 = 0x10;

const EXTRA_ZIP64: u16 = 0x0001;
const EXTRA_TIMESTAMP: u16 = 0x5455;
const EXTRA_UNIX_IDS: u16 = 0x7875;

/// Where an entry's data lives and how it is encoded.
#[derive(Debug, Clone)]
struct Record {
    method: u16,
    flags: u16,
    compressed_size: u64,
    local_offset: u64,
}

#[cfg(feature = "gzip")]
struct Inflater {
    locator: usize,
    position: u64,
    decoder: flate2::read::DeflateDecoder<crate::io::SourceReader>,
}

/// A ZIP archive read through a [`ByteSource`].
pub struct ZipArchive {
    source: Arc<dyn ByteSource>,
    entries: Vec<ForeignEntry>,
    records: Vec<Record>,
    #[cfg(feature = "gzip")]
    inflater: Mutex<Option<Inflater>>,
}

impl fmt::Debug for ZipArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipArchive")
            .field("len", &self.source.len())
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn le64(bytes: &[u8], at: usize) -> u64 {
    u64::from(le32(bytes, at)) | (u64::from(le32(bytes, at + 4)) << 32)
}

impl ZipArchive {
    /// Reads the central directory of the archive in `source`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if no valid end-of-central-directory
    /// record is found or the directory is malformed.
    pub fn open(source: Arc<dyn ByteSource>) -> Result<Self> {
        let len = source.len();
        let tail_len = len.min((EOCD_LEN + MAX_COMMENT) as u64);
        let tail_start = len - tail_len;
        let tail = source.read_vec_at(tail_start, tail_len as usize)?;
        let eocd_pos = find_eocd(&tail)
            .ok_or_else(|| Error::corrupt(len, "end of central directory not found"))?;
        let eocd = &tail[eocd_pos..];
        let eocd_offset = tail_start + eocd_pos as u64;

        let mut total = u64::from(le16(eocd, 10));
        let mut directory_size = u64::from(le32(eocd, 12));
        let mut directory_offset = u64::from(le32(eocd, 16));

        if eocd_offset >= ZIP64_LOCATOR_LEN {
            let locator =
                source.read_vec_at(eocd_offset - ZIP64_LOCATOR_LEN, ZIP64_LOCATOR_LEN as usize)?;
            if le32(&locator, 0) == ZIP64_LOCATOR_SIG {
                let record_offset = le64(&locator, 8);
                let record = source.read_vec_at(record_offset, ZIP64_EOCD_LEN)?;
                if record.len() < ZIP64_EOCD_LEN || le32(&record, 0) != ZIP64_EOCD_SIG {
                    return Err(Error::corrupt(
                        record_offset,
                        "bad ZIP64 end of central directory",
                    ));
                }
                total = le64(&record, 32);
                directory_size = le64(&record, 40);
                directory_offset = le64(&record, 48);
            }
        }

        if directory_offset.saturating_add(directory_size) > len {
            return Err(Error::truncated(
                directory_offset,
                "central directory extends past the end of the file",
            ));
        }
        let directory = source.read_vec_at(directory_offset, directory_size as usize)?;
        let (mut entries, records) = parse_directory(&directory, directory_offset, total)?;

        let mut archive = Self {
            source,
            entries: Vec::new(),
            records,
            #[cfg(feature = "gzip")]
            inflater: Mutex::new(None),
        };

        // Link targets are stored as entry data.
        for (locator, entry) in entries.iter_mut().enumerate() {
            if matches!(entry.kind, EntryKind::Symlink { .. }) {
                let data = archive.extract_record(locator, entry.size, 0, entry.size as usize)?;
                let target = String::from_utf8_lossy(&data).into_owned();
                entry.kind = EntryKind::Symlink { target };
            }
        }
        archive.entries = entries;
        Ok(archive)
    }

    /// Number of entries in the central directory.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the archive has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn extract_record(&self, locator: usize, size: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let record = self
            .records
            .get(locator)
            .ok_or_else(|| Error::InvalidArchivePath(format!("no ZIP entry #{locator}")))?;
        if record.flags & FLAG_ENCRYPTED != 0 {
            return Err(Error::UnsupportedFormat(
                "encrypted ZIP entries are not supported".into(),
            ));
        }
        let len = clamp_read(size, offset, len);
        if len == 0 {
            return Ok(Vec::new());
        }
        let data_start = self.data_start(record)?;
        match record.method {
            METHOD_STORED => {
                let available = record.compressed_size.saturating_sub(offset);
                let data = self
                    .source
                    .read_vec_at(data_start + offset, len.min(available as usize))?;
                if data.len() < len {
                    return Err(Error::truncated(
                        data_start + offset + data.len() as u64,
                        "stored ZIP entry ends early",
                    ));
                }
                Ok(data)
            }
            #[cfg(feature = "gzip")]
            METHOD_DEFLATE => self.inflate(locator, record, data_start, offset, len),
            method => Err(Error::UnsupportedFormat(format!(
                "ZIP compression method {method}"
            ))),
        }
    }

    fn data_start(&self, record: &Record) -> Result<u64> {
        let header = self.source.read_vec_at(record.local_offset, LOCAL_LEN)?;
        if header.len() < LOCAL_LEN {
            return Err(Error::truncated(record.local_offset, "local header ends early"));
        }
        if le32(&header, 0) != LOCAL_SIG {
            return Err(Error::corrupt(record.local_offset, "bad local header signature"));
        }
        Ok(record.local_offset
            + LOCAL_LEN as u64
            + u64::from(le16(&header, 26))
            + u64::from(le16(&header, 28)))
    }

    #[cfg(feature = "gzip")]
    fn inflate(
        &self,
        locator: usize,
        record: &Record,
        data_start: u64,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        use crate::io::{SliceSource, SourceReader};
        use std::io::{self, Read};

        let mut slot = self.inflater.lock().unwrap_or_else(PoisonError::into_inner);
        let mut inflater = match slot.take() {
            Some(inflater) if inflater.locator == locator && inflater.position <= offset => inflater,
            _ => {
                let compressed: Arc<dyn ByteSource> = Arc::new(SliceSource::new(
                    Arc::clone(&self.source),
                    data_start,
                    record.compressed_size,
                ));
                Inflater {
                    locator,
                    position: 0,
                    decoder: flate2::read::DeflateDecoder::new(SourceReader::new(compressed, 0)),
                }
            }
        };

        let skip = offset - inflater.position;
        let skipped = io::copy(&mut (&mut inflater.decoder).take(skip), &mut io::sink())
            .map_err(|e| Error::from_decode(e, data_start))?;
        inflater.position += skipped;

        let mut out = vec![0u8; len];
        let mut filled = 0;
        if skipped == skip {
            while filled < len {
                match inflater.decoder.read(&mut out[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(Error::from_decode(e, data_start)),
                }
            }
        }
        inflater.position += filled as u64;
        if filled < len {
            return Err(Error::truncated(
                data_start,
                format!("deflate stream ends after {} bytes", inflater.position),
            ));
        }
        *slot = Some(inflater);
        Ok(out)
    }
}

impl ForeignArchive for ZipArchive {
    fn format_name(&self) -> &'static str {
        "zip"
    }

    fn list(&self) -> Result<Vec<ForeignEntry>> {
        Ok(self.entries.clone())
    }

    fn extract(&self, entry: &ForeignEntry, offset: u64, len: usize) -> Result<Vec<u8>> {
        let locator = usize::try_from(entry.locator)
            .map_err(|_| Error::InvalidArchivePath(format!("no ZIP entry #{}", entry.locator)))?;
        self.extract_record(locator, entry.size, offset, len)
    }
}

/// Position of the end-of-central-directory record in `tail`.
fn find_eocd(tail: &[u8]) -> Option<usize> {
    let last = tail.len().checked_sub(EOCD_LEN)?;
    (0..=last).rev().find(|&pos| {
        le32(tail, pos) == EOCD_SIG
            && pos + EOCD_LEN + usize::from(le16(tail, pos + 20)) <= tail.len()
    })
}

fn parse_directory(
    directory: &[u8],
    base: u64,
    total: u64,
) -> Result<(Vec<ForeignEntry>, Vec<Record>)> {
    let mut entries = Vec::new();
    let mut records = Vec::new();
    let mut pos = 0usize;
    for _ in 0..total {
        let at = base + pos as u64;
        let header = directory
            .get(pos..pos + CENTRAL_LEN)
            .ok_or_else(|| Error::truncated(at, "central directory ends early"))?;
        if le32(header, 0) != CENTRAL_SIG {
            return Err(Error::corrupt(at, "bad central directory signature"));
        }
        let made_by = le16(header, 4);
        let flags = le16(header, 8);
        let method = le16(header, 10);
        let dos_time = le16(header, 12);
        let dos_date = le16(header, 14);
        let compressed32 = le32(header, 20);
        let size32 = le32(header, 24);
        let name_len = usize::from(le16(header, 28));
        let extra_len = usize::from(le16(header, 30));
        let comment_len = usize::from(le16(header, 32));
        let external = le32(header, 38);
        let offset32 = le32(header, 42);

        let variable = directory
            .get(pos + CENTRAL_LEN..pos + CENTRAL_LEN + name_len + extra_len)
            .ok_or_else(|| Error::truncated(at, "central directory entry ends early"))?;
        let name = String::from_utf8_lossy(&variable[..name_len]).into_owned();
        let extra = &variable[name_len..];
        pos += CENTRAL_LEN + name_len + extra_len + comment_len;

        let mut size = u64::from(size32);
        let mut compressed_size = u64::from(compressed32);
        let mut local_offset = u64::from(offset32);
        let mut mtime = Timestamp::from_dos(dos_date, dos_time);
        let mut ownership = Ownership::default();
        for (id, data) in extra_fields(extra) {
            match id {
                EXTRA_ZIP64 => {
                    let mut values = data.chunks_exact(8).map(|chunk| le64(chunk, 0));
                    if size32 == u32::MAX {
                        size = values.next().unwrap_or(size);
                    }
                    if compressed32 == u32::MAX {
                        compressed_size = values.next().unwrap_or(compressed_size);
                    }
                    if offset32 == u32::MAX {
                        local_offset = values.next().unwrap_or(local_offset);
                    }
                }
                EXTRA_TIMESTAMP if data.len() >= 5 && data[0] & 1 != 0 => {
                    mtime = Timestamp::from_unix_secs(i64::from(le32(data, 1) as i32));
                }
                EXTRA_UNIX_IDS => {
                    if let Some((uid, gid)) = unix_ids(data) {
                        ownership = Ownership::from_ids(uid, gid);
                    }
                }
                _ => {}
            }
        }

        let unix_mode = if made_by >> 8 == HOST_UNIX {
            external >> 16
        } else {
            0
        };
        let kind = if unix_mode & S_IFMT == S_IFLNK {
            EntryKind::Symlink {
                target: String::new(),
            }
        } else if name.ends_with('/')
            || external & DOS_DIRECTORY != 0
            || unix_mode & S_IFMT == S_IFDIR
        {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let mode = if unix_mode & 0o7777 != 0 {
            unix_mode & 0o7777
        } else if kind == EntryKind::Directory {
            0o755
        } else if external & DOS_READONLY != 0 {
            0o444
        } else {
            0o644
        };

        entries.push(ForeignEntry {
            path: name,
            size: if kind == EntryKind::Directory { 0 } else { size },
            kind,
            mode,
            mtime,
            ownership,
            locator: records.len() as u64,
        });
        records.push(Record {
            method,
            flags,
            compressed_size,
            local_offset,
        });
    }
    Ok((entries, records))
}

/// `(id, data)` pairs of an extra field block; a malformed tail is ignored.
fn extra_fields(mut extra: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    std::iter::from_fn(move || {
        if extra.len() < 4 {
            return None;
        }
        let id = le16(extra, 0);
        let len = usize::from(le16(extra, 2));
        let data = extra.get(4..4 + len)?;
        extra = &extra[4 + len..];
        Some((id, data))
    })
}

/// Info-ZIP "new Unix" extra field: version, then length-prefixed UID and GID.
fn unix_ids(data: &[u8]) -> Option<(u32, u32)> {
    let uid_len = usize::from(*data.get(1)?);
    let uid = data.get(2..2 + uid_len)?;
    let gid_len = usize::from(*data.get(2 + uid_len)?);
    let gid = data.get(3 + uid_len..3 + uid_len + gid_len)?;
    Some((little_endian_id(uid)?, little_endian_id(gid)?))
}

fn little_endian_id(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 && bytes[4..].iter().any(|&b| b != 0) {
        return None;
    }
    Some(
        bytes
            .iter()
            .take(4)
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b)),
    )
}
