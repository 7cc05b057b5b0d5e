//! Sequential index construction.

use std::time::Instant;

use log::{debug, info};

use super::header::{self, BLOCK_SIZE, RawHeader};
use super::sparse;
use crate::archive_path;
use crate::checkpoint::{Checkpoint, CheckpointList};
use crate::codec::{StreamDecoder, read_full};
use crate::config::MountConfig;
use crate::index::{Entry, EntryKind, Index, S_IFDIR, S_IFLNK, S_IFREG, SparseMap};
use crate::ownership::Ownership;
use crate::timestamp::Timestamp;
use crate::{Error, READ_BUFFER_SIZE, Result};

/// Extended headers larger than this are treated as corruption.
const MAX_EXTENDED_HEADER: u64 = 16 * 1024 * 1024;

/// Decoded bytes skipped between two checkpoint observations.
const SKIP_STEP: u64 = READ_BUFFER_SIZE as u64;

const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// The result of a completed scan.
#[derive(Debug)]
pub struct BuiltIndex {
    /// Every entry found.
    pub index: Index,
    /// Resume points recorded during the scan.
    pub checkpoints: CheckpointList,
    /// Length of the whole decoded stream.
    pub decoded_len: u64,
    /// Decoded offset where the archive's records end.
    ///
    /// For tar this is the first end-of-archive block; appended members
    /// start here.
    pub scan_end: u64,
}

/// A scan that stopped at corrupt or truncated data.
#[derive(Debug, thiserror::Error)]
#[error("index build failed after {} entries: {error}", .partial.index.len())]
pub struct BuildFailure {
    /// Everything that was fully parsed before the failure.
    pub partial: BuiltIndex,
    /// Why the scan stopped.
    #[source]
    pub error: Error,
}

impl From<BuildFailure> for Error {
    fn from(failure: BuildFailure) -> Self {
        failure.error
    }
}

#[cfg(feature = "regex")]
#[derive(Debug)]
struct Transform {
    pattern: regex::Regex,
    replacement: String,
}

/// Builds indexes from decoded tar streams.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use seekstone::{CodecKind, IndexBuilder, MemorySource, MountConfig};
///
/// let mut tar = tar::Builder::new(Vec::new());
/// let mut header = tar::Header::new_gnu();
/// header.set_size(5);
/// header.set_mode(0o644);
/// tar.append_data(&mut header, "docs/hello.txt", &b"hello"[..])?;
/// let bytes = tar.into_inner()?;
///
/// let decoder = CodecKind::Identity.codec()?.open_decoder(Arc::new(MemorySource::new(bytes)))?;
/// let built = IndexBuilder::new(&MountConfig::default())?.build(decoder)?;
///
/// let entry = built.index.current("docs/hello.txt").unwrap();
/// assert_eq!(entry.size, 5);
/// assert_eq!(entry.content_offset, 512);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct IndexBuilder {
    spacing: u64,
    source_id: u32,
    oci_whiteouts: bool,
    #[cfg(feature = "regex")]
    transform: Option<Transform>,
}

impl IndexBuilder {
    /// Creates a builder with the checkpoint spacing, whiteout handling and
    /// path transform of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the path transform does not compile.
    pub fn new(config: &MountConfig) -> Result<Self> {
        #[cfg(feature = "regex")]
        let transform = match &config.transform {
            Some(t) => Some(Transform {
                pattern: regex::Regex::new(&t.pattern)
                    .map_err(|e| Error::InvalidConfig(format!("invalid transform pattern: {e}")))?,
                replacement: t.replacement.clone(),
            }),
            None => None,
        };
        #[cfg(not(feature = "regex"))]
        if config.transform.is_some() {
            return Err(Error::InvalidConfig(
                "path transforms require the `regex` feature".into(),
            ));
        }

        Ok(Self {
            spacing: config.checkpoint_spacing.max(1),
            source_id: 0,
            oci_whiteouts: config.oci_whiteouts,
            #[cfg(feature = "regex")]
            transform,
        })
    }

    /// Tags every entry with a source id.
    pub fn source_id(mut self, id: u32) -> Self {
        self.source_id = id;
        self
    }

    /// Scans a tar stream from its start.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildFailure`] holding every entry parsed before a
    /// corrupt header or the end of truncated data.
    pub fn build(
        &self,
        decoder: Box<dyn StreamDecoder>,
    ) -> std::result::Result<BuiltIndex, BuildFailure> {
        let started = Instant::now();
        let result = Scan::new(self, decoder, Index::new(), CheckpointList::new()).run();
        if let Ok(built) = &result {
            info!(
                "indexed {} entries ({} decoded bytes, {} checkpoints) in {:.2?}",
                built.index.len(),
                built.decoded_len,
                built.checkpoints.len(),
                started.elapsed()
            );
            self.report_sparse_checkpoints(built);
        }
        result
    }

    /// Continues a scan of a tar that has grown since `previous` was built.
    ///
    /// `decoder` must be positioned at `previous.scan_end`. New entries get
    /// occurrence numbers after every existing one.
    ///
    /// # Errors
    ///
    /// As [`build`](Self::build); the partial index includes `previous`.
    pub fn resume(
        &self,
        previous: BuiltIndex,
        decoder: Box<dyn StreamDecoder>,
    ) -> std::result::Result<BuiltIndex, BuildFailure> {
        if decoder.position() != previous.scan_end {
            let error = Error::InvalidIndex(format!(
                "cannot resume scan at {:#x}: decoder is at {:#x}",
                previous.scan_end,
                decoder.position()
            ));
            return Err(BuildFailure {
                partial: previous,
                error,
            });
        }
        let before = previous.index.len();
        let result = Scan::new(self, decoder, previous.index, previous.checkpoints).run();
        if let Ok(built) = &result {
            info!(
                "appended {} entries to an existing index",
                built.index.len() - before
            );
        }
        result
    }

    /// Walks a stream that is not a container.
    ///
    /// The result holds one file, `name`, spanning the whole decoded stream.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildFailure`] if the stream is corrupt or truncated; the
    /// partial index reports the bytes decoded so far.
    pub fn scan_raw(
        &self,
        decoder: Box<dyn StreamDecoder>,
        name: &str,
        mtime: Timestamp,
        ownership: Ownership,
    ) -> std::result::Result<BuiltIndex, BuildFailure> {
        let mut scan = Scan::new(self, decoder, Index::new(), CheckpointList::new());
        let outcome = scan.skip_to_end();
        let size = scan.position();
        scan.index.insert(Entry {
            path: archive_path::normalize(name),
            kind: EntryKind::File,
            size,
            mode: S_IFREG | 0o644,
            ownership,
            mtime,
            content_offset: 0,
            header_offset: 0,
            source_id: self.source_id,
            occurrence: 0,
            synthetic: false,
            sparse: None,
        });
        let built = BuiltIndex {
            index: scan.index,
            checkpoints: scan.checkpoints,
            decoded_len: size,
            scan_end: size,
        };
        match outcome {
            Ok(()) => Ok(built),
            Err(error) => Err(BuildFailure {
                partial: built,
                error,
            }),
        }
    }

    /// Logs stretches the codec offered no resume point in, such as a
    /// single zstd frame.
    fn report_sparse_checkpoints(&self, built: &BuiltIndex) {
        let points = built.checkpoints.to_vec();
        let ends = points
            .iter()
            .map(|p| p.decompressed_offset)
            .skip(1)
            .chain(std::iter::once(built.decoded_len));
        let widest = points
            .iter()
            .zip(ends)
            .map(|(p, end)| end.saturating_sub(p.decompressed_offset))
            .max()
            .unwrap_or(0);
        if widest > self.spacing.saturating_mul(2) {
            info!(
                "widest stretch without a checkpoint is {widest} bytes ({} requested); \
                 reads into it decode from its start",
                self.spacing
            );
        }
    }

    fn entry_path(&self, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        #[cfg(feature = "regex")]
        {
            if let Some(t) = &self.transform {
                let rewritten = t.pattern.replace_all(&text, t.replacement.as_str());
                return archive_path::normalize(&rewritten);
            }
        }
        archive_path::normalize(&text)
    }
}

/// Fields a PAX extended header may override.
#[derive(Debug, Clone, Default)]
struct PaxFields {
    path: Option<Vec<u8>>,
    linkpath: Option<Vec<u8>>,
    size: Option<u64>,
    mtime: Option<Timestamp>,
    uid: Option<u64>,
    gid: Option<u64>,
    uname: Option<Vec<u8>>,
    gname: Option<Vec<u8>>,
    sparse: PaxSparse,
}

/// The `GNU.sparse.*` records of one extended header.
#[derive(Debug, Clone, Default)]
struct PaxSparse {
    major: Option<u64>,
    name: Option<Vec<u8>>,
    real_size: Option<u64>,
    /// Offset and length values of format 0.0 or 0.1, in order.
    numbers: Vec<u64>,
    /// A malformed `GNU.sparse.map`.
    bad_map: bool,
}

impl PaxSparse {
    fn is_sparse(&self) -> bool {
        self.major.is_some() || self.real_size.is_some() || !self.numbers.is_empty()
    }
}

impl PaxFields {
    fn apply(&mut self, records: Vec<(String, Vec<u8>)>) {
        for (key, value) in records {
            match key.as_str() {
                "path" => self.path = Some(value),
                "linkpath" => self.linkpath = Some(value),
                "size" => self.size = pax_number(&value),
                "mtime" => {
                    self.mtime = std::str::from_utf8(&value)
                        .ok()
                        .and_then(Timestamp::parse_pax);
                }
                "uid" => self.uid = pax_number(&value),
                "gid" => self.gid = pax_number(&value),
                "uname" => self.uname = Some(value),
                "gname" => self.gname = Some(value),
                "GNU.sparse.major" => self.sparse.major = pax_number(&value),
                "GNU.sparse.name" => self.sparse.name = Some(value),
                "GNU.sparse.realsize" | "GNU.sparse.size" => {
                    self.sparse.real_size = pax_number(&value);
                }
                "GNU.sparse.offset" | "GNU.sparse.numbytes" => match pax_number(&value) {
                    Some(n) => self.sparse.numbers.push(n),
                    None => self.sparse.bad_map = true,
                },
                "GNU.sparse.map" => match sparse::parse_map_value(&value) {
                    Some(numbers) => self.sparse.numbers = numbers,
                    None => self.sparse.bad_map = true,
                },
                _ => {}
            }
        }
    }
}

fn pax_number(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

/// Records that modify the next regular header.
#[derive(Debug, Default)]
struct Pending {
    long_name: Option<Vec<u8>>,
    long_link: Option<Vec<u8>>,
    pax: PaxFields,
}

fn padded(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

struct Scan<'a> {
    builder: &'a IndexBuilder,
    decoder: Box<dyn StreamDecoder>,
    index: Index,
    checkpoints: CheckpointList,
    last: Checkpoint,
    occurrence: u64,
    globals: PaxFields,
    record_start: u64,
}

impl<'a> Scan<'a> {
    fn new(
        builder: &'a IndexBuilder,
        mut decoder: Box<dyn StreamDecoder>,
        index: Index,
        checkpoints: CheckpointList,
    ) -> Self {
        decoder.set_resume_spacing(builder.spacing);
        let record_start = decoder.position();
        Self {
            builder,
            decoder,
            occurrence: index.next_occurrence(),
            index,
            last: checkpoints.last(),
            checkpoints,
            globals: PaxFields::default(),
            record_start,
        }
    }

    fn position(&self) -> u64 {
        self.decoder.position()
    }

    fn run(mut self) -> std::result::Result<BuiltIndex, BuildFailure> {
        match self.walk() {
            Ok(scan_end) => Ok(self.finish(scan_end)),
            Err(error) => {
                debug!(
                    "scan stopped at record {:#x} after {} entries: {error}",
                    self.record_start,
                    self.index.len()
                );
                let decoded_len = self.position();
                Err(BuildFailure {
                    partial: BuiltIndex {
                        index: self.index,
                        checkpoints: self.checkpoints,
                        decoded_len,
                        scan_end: self.record_start,
                    },
                    error,
                })
            }
        }
    }

    /// Parses records until the end of the archive and returns where it ends.
    fn walk(&mut self) -> Result<u64> {
        let mut pending = Pending::default();
        let mut block = [0u8; BLOCK_SIZE];
        loop {
            let header_offset = self.position();
            self.record_start = header_offset;
            let n = read_full(&mut *self.decoder, &mut block)
                .map_err(|e| Error::from_decode(e, header_offset))?;
            if n == 0 {
                return Ok(header_offset);
            }
            if n < BLOCK_SIZE {
                return Err(Error::truncated(
                    header_offset + n as u64,
                    "stream ended inside a header block",
                ));
            }
            self.observe();
            if header::is_zero_block(&block) {
                return Ok(header_offset);
            }

            let raw = RawHeader::parse(&block, header_offset)?;
            match raw.typeflag {
                b'L' => {
                    let data = self.read_extended(raw.size, header_offset)?;
                    pending.long_name = Some(header::cstr(&data).to_vec());
                }
                b'K' => {
                    let data = self.read_extended(raw.size, header_offset)?;
                    pending.long_link = Some(header::cstr(&data).to_vec());
                }
                b'x' | b'X' => {
                    let data = self.read_extended(raw.size, header_offset)?;
                    pending.pax.apply(header::parse_pax(&data, header_offset)?);
                }
                b'g' => {
                    let data = self.read_extended(raw.size, header_offset)?;
                    self.globals.apply(header::parse_pax(&data, header_offset)?);
                }
                b'V' => {
                    self.skip_exact(padded(raw.size))?;
                    pending = Pending::default();
                }
                _ => {
                    let modifiers = std::mem::take(&mut pending);
                    self.record(raw, &block, modifiers, header_offset)?;
                }
            }
        }
    }

    fn record(
        &mut self,
        raw: RawHeader,
        block: &[u8; BLOCK_SIZE],
        pending: Pending,
        header_offset: u64,
    ) -> Result<()> {
        let local = pending.pax;
        let globals = &self.globals;

        let name = local
            .sparse
            .name
            .clone()
            .or(local.path)
            .or(pending.long_name)
            .or_else(|| globals.path.clone())
            .unwrap_or(raw.name);
        let link = local
            .linkpath
            .or(pending.long_link)
            .or_else(|| globals.linkpath.clone())
            .unwrap_or(raw.linkname);
        let size = local.size.or(globals.size).unwrap_or(raw.size);
        let mtime = local
            .mtime
            .or(globals.mtime)
            .unwrap_or(Timestamp::from_unix_secs(raw.mtime));
        let uid = local.uid.or(globals.uid).unwrap_or(raw.uid);
        let gid = local.gid.or(globals.gid).unwrap_or(raw.gid);
        let uname = local
            .uname
            .or_else(|| globals.uname.clone())
            .unwrap_or(raw.uname);
        let gname = local
            .gname
            .or_else(|| globals.gname.clone())
            .unwrap_or(raw.gname);

        // Links, devices, fifos and directories carry no data even when the
        // size field says otherwise.
        let has_data = !matches!(raw.typeflag, b'1'..=b'6');
        let data_len = if has_data { size } else { 0 };

        let perm = raw.mode;
        let trailing_slash = name.last() == Some(&b'/');
        let (kind, mode, size) = match raw.typeflag {
            b'1' => (
                EntryKind::HardLink {
                    target: self.builder.entry_path(&link),
                },
                S_IFREG | perm,
                0,
            ),
            b'2' => (
                EntryKind::Symlink {
                    target: String::from_utf8_lossy(&link).into_owned(),
                },
                S_IFLNK | perm,
                0,
            ),
            b'5' | b'D' => (EntryKind::Directory, S_IFDIR | perm, 0),
            b'3' | b'4' | b'6' => (EntryKind::File, S_IFREG | perm, 0),
            b'0' | 0 | b'7' if trailing_slash => (EntryKind::Directory, S_IFDIR | perm, 0),
            _ => (EntryKind::File, S_IFREG | perm, size),
        };

        let (sparse, size, map_len) = if kind == EntryKind::File {
            match self.sparse_map(raw.typeflag, block, &local.sparse, data_len, header_offset)? {
                Some((map, real_size, map_len)) => (Some(map), real_size, map_len),
                None => (None, size, 0),
            }
        } else {
            (None, size, 0)
        };
        let content_offset = self.position();
        self.skip_exact(padded(data_len) - map_len)?;

        let mut path = self.builder.entry_path(&name);
        let mut kind = kind;
        let mut size = size;
        let mut sparse = sparse;
        if self.builder.oci_whiteouts {
            if let Some((parent, file_name)) = archive_path::split_parent(&path) {
                if file_name == OPAQUE_WHITEOUT {
                    return Ok(());
                }
                if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                    if !hidden.is_empty() {
                        path = archive_path::join(parent, hidden);
                        kind = EntryKind::Deleted;
                        size = 0;
                        sparse = None;
                    }
                }
            }
        }
        if path.is_empty() {
            // The archive's own root ("./"); the index has one already.
            return Ok(());
        }

        let ownership = Ownership::from_ids(clamp_id(uid), clamp_id(gid)).with_names(
            String::from_utf8_lossy(&uname),
            String::from_utf8_lossy(&gname),
        );
        self.index.insert(Entry {
            path,
            kind,
            size,
            mode,
            ownership,
            mtime,
            content_offset,
            header_offset,
            source_id: self.builder.source_id,
            occurrence: self.occurrence,
            synthetic: false,
            sparse,
        });
        self.occurrence += 1;
        Ok(())
    }

    /// Reads the sparse map of a file record, if it has one.
    ///
    /// Returns the map, the restored size, and how many bytes of the
    /// record's data the map itself took. Old GNU extension blocks sit
    /// between the header and the data and do not count.
    fn sparse_map(
        &mut self,
        typeflag: u8,
        block: &[u8; BLOCK_SIZE],
        pax: &PaxSparse,
        data_len: u64,
        header_offset: u64,
    ) -> Result<Option<(SparseMap, u64, u64)>> {
        let (segments, real_size, map_len) = if typeflag == b'S' {
            let header = sparse::OldGnuSparse::parse(block, header_offset)?;
            let mut segments = header.segments;
            let mut extended = header.extended;
            while extended {
                let at = self.position();
                let mut extension = [0u8; BLOCK_SIZE];
                self.read_block(&mut extension, "stream ended inside a sparse extension block")?;
                extended = sparse::parse_extension(&extension, at, &mut segments)?;
            }
            (segments, header.real_size, 0)
        } else if pax.major == Some(1) {
            let mut map = Vec::new();
            let segments = loop {
                let at = self.position();
                if map.len() as u64 + BLOCK_SIZE as u64 > padded(data_len)
                    || map.len() as u64 >= MAX_EXTENDED_HEADER
                {
                    return Err(Error::corrupt(at, "sparse map runs past the file data"));
                }
                let mut chunk = [0u8; BLOCK_SIZE];
                self.read_block(&mut chunk, "stream ended inside a sparse map")?;
                map.extend_from_slice(&chunk);
                if let Some(segments) = sparse::parse_data_map(&map, at)? {
                    break segments;
                }
            };
            let real_size = pax
                .real_size
                .ok_or_else(|| Error::corrupt(header_offset, "sparse file without a real size"))?;
            (segments, real_size, map.len() as u64)
        } else if pax.is_sparse() {
            if pax.bad_map {
                return Err(Error::corrupt(header_offset, "invalid GNU.sparse map record"));
            }
            let real_size = pax
                .real_size
                .ok_or_else(|| Error::corrupt(header_offset, "sparse file without a real size"))?;
            (sparse::pairs(&pax.numbers, header_offset)?, real_size, 0)
        } else {
            return Ok(None);
        };

        let map = SparseMap::new(segments, real_size).ok_or_else(|| {
            Error::corrupt(header_offset, "sparse map out of order or past the file's end")
        })?;
        if map.stored_len() > data_len.saturating_sub(map_len) {
            return Err(Error::corrupt(
                header_offset,
                "sparse map needs more data than the record holds",
            ));
        }
        Ok(Some((map, real_size, map_len)))
    }

    fn read_block(&mut self, block: &mut [u8; BLOCK_SIZE], what: &'static str) -> Result<()> {
        let at = self.position();
        let n = read_full(&mut *self.decoder, block).map_err(|e| Error::from_decode(e, at))?;
        self.observe();
        if n < BLOCK_SIZE {
            return Err(Error::truncated(at + n as u64, what));
        }
        Ok(())
    }

    /// Reads the payload of a GNU or PAX extended header.
    fn read_extended(&mut self, size: u64, header_offset: u64) -> Result<Vec<u8>> {
        if size > MAX_EXTENDED_HEADER {
            return Err(Error::corrupt(
                header_offset,
                format!("extended header of {size} bytes"),
            ));
        }
        let at = self.position();
        let mut data = vec![0u8; size as usize];
        let n = read_full(&mut *self.decoder, &mut data).map_err(|e| Error::from_decode(e, at))?;
        if n < data.len() {
            return Err(Error::truncated(
                at + n as u64,
                "stream ended inside an extended header",
            ));
        }
        self.skip_exact(padded(size) - size)?;
        Ok(data)
    }

    fn skip_exact(&mut self, len: u64) -> Result<()> {
        let mut remaining = len;
        while remaining > 0 {
            let at = self.position();
            let want = remaining.min(SKIP_STEP);
            let skipped = self
                .decoder
                .skip(want)
                .map_err(|e| Error::from_decode(e, at))?;
            self.observe();
            if skipped < want {
                return Err(Error::truncated(
                    at + skipped,
                    "stream ended inside entry data",
                ));
            }
            remaining -= want;
        }
        Ok(())
    }

    fn skip_to_end(&mut self) -> Result<()> {
        loop {
            let at = self.position();
            let skipped = self
                .decoder
                .skip(SKIP_STEP)
                .map_err(|e| Error::from_decode(e, at))?;
            self.observe();
            if skipped < SKIP_STEP {
                return Ok(());
            }
        }
    }

    /// Records the decoder's resume point once it is far enough past the last one.
    fn observe(&mut self) {
        let resume = self.decoder.snapshot_state();
        let far_enough = resume.decompressed_offset
            >= self.last.decompressed_offset.saturating_add(self.builder.spacing);
        if far_enough && self.checkpoints.insert(resume.clone()) {
            self.last = resume;
        }
    }

    fn finish(mut self, scan_end: u64) -> BuiltIndex {
        // Trailing padding still counts towards the decoded length.
        let at = self.position();
        if let Err(e) = self.skip_to_end() {
            debug!("ignoring undecodable data after offset {at:#x}: {e}");
        }
        BuiltIndex {
            decoded_len: self.position(),
            index: self.index,
            checkpoints: self.checkpoints,
            scan_end,
        }
    }
}

fn clamp_id(id: u64) -> u32 {
    u32::try_from(id).unwrap_or(u32::MAX)
}
