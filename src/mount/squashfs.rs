//! SquashFS images.
//!
//! Version 4 images (little-endian, as written by `mksquashfs` since 2009)
//! are walked once at open time: the inode and directory tables are
//! decoded, every path is listed, and the block layout of each regular file
//! is kept. File data is decompressed block by block on demand; the last
//! decoded block stays cached for sequential reads.
//!
//! zlib, xz and zstd compression are handled when the matching codec
//! feature is enabled; lzma, lzo and lz4 report
//! [`Error::UnsupportedFormat`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};

use super::clamp_read;
use super::foreign::{ForeignArchive, ForeignEntry};
use crate::index::EntryKind;
use crate::io::ByteSource;
use crate::ownership::Ownership;
use crate::timestamp::Timestamp;
use crate::{Error, Result};

const MAGIC: u32 = 0x7371_7368;
const SUPERBLOCK_LEN: usize = 96;
const VERSION_MAJOR: u16 = 4;
const MIN_BLOCK_SIZE: u32 = 4096;
const MAX_BLOCK_SIZE: u32 = 1 << 20;

const METADATA_SIZE: usize = 8192;
const METADATA_UNCOMPRESSED: u16 = 0x8000;
const DATA_UNCOMPRESSED: u32 = 1 << 24;
const DATA_SIZE_MASK: u32 = DATA_UNCOMPRESSED - 1;
const NO_FRAGMENT: u32 = u32::MAX;
const NOT_PRESENT: u64 = u64::MAX;

const DIRECTORY_HEADER_LEN: usize = 12;
const DIRECTORY_ENTRY_LEN: usize = 8;
const MAX_DIRECTORY_RUN: u32 = 256;
const MAX_LINK_TARGET: usize = 1 << 16;

const BASIC_DIRECTORY: u16 = 1;
const BASIC_FILE: u16 = 2;
const BASIC_SYMLINK: u16 = 3;
const EXTENDED_DIRECTORY: u16 = 8;
const EXTENDED_FILE: u16 = 9;
const EXTENDED_SYMLINK: u16 = 10;

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn le64(bytes: &[u8], at: usize) -> u64 {
    u64::from(le32(bytes, at)) | (u64::from(le32(bytes, at + 4)) << 32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compressor {
    Zlib,
    Lzma,
    Lzo,
    Xz,
    Lz4,
    Zstd,
}

impl Compressor {
    fn from_id(id: u16) -> Result<Self> {
        Ok(match id {
            1 => Self::Zlib,
            2 => Self::Lzma,
            3 => Self::Lzo,
            4 => Self::Xz,
            5 => Self::Lz4,
            6 => Self::Zstd,
            _ => return Err(Error::corrupt(20, format!("unknown SquashFS compressor {id}"))),
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Zlib => "zlib",
            Self::Lzma => "lzma",
            Self::Lzo => "lzo",
            Self::Xz => "xz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    /// Decompresses one block of at most `limit` bytes read at `at`.
    #[cfg_attr(
        not(any(feature = "gzip", feature = "xz", feature = "zstd")),
        allow(unused_variables)
    )]
    fn decompress(self, data: &[u8], limit: usize, at: u64) -> Result<Vec<u8>> {
        match self {
            #[cfg(feature = "gzip")]
            Self::Zlib => read_limited(flate2::read::ZlibDecoder::new(data), limit, at),
            #[cfg(feature = "xz")]
            Self::Xz => read_limited(lzma_rust2::XzReader::new(data, true), limit, at),
            #[cfg(feature = "zstd")]
            Self::Zstd => {
                let decoder = ::zstd::stream::read::Decoder::with_buffer(data)
                    .map_err(|e| Error::from_decode(e, at))?;
                read_limited(decoder, limit, at)
            }
            other => Err(Error::UnsupportedFormat(format!(
                "SquashFS {} compression",
                other.name()
            ))),
        }
    }
}

#[cfg(any(feature = "gzip", feature = "xz", feature = "zstd"))]
fn read_limited(mut reader: impl std::io::Read, limit: usize, at: u64) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut out = Vec::with_capacity(limit);
    (&mut reader)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::from_decode(e, at))?;
    if out.len() > limit {
        return Err(Error::corrupt(at, "SquashFS block expands past its size"));
    }
    Ok(out)
}

#[derive(Debug, Clone)]
struct Superblock {
    block_size: u32,
    fragment_count: u32,
    compressor: Compressor,
    id_count: u16,
    root_inode: u64,
    bytes_used: u64,
    id_table: u64,
    inode_table: u64,
    directory_table: u64,
    fragment_table: u64,
}

impl Superblock {
    fn parse(bytes: &[u8], len: u64) -> Result<Self> {
        if bytes.len() < SUPERBLOCK_LEN {
            return Err(Error::truncated(0, "SquashFS superblock ends early"));
        }
        if le32(bytes, 0) != MAGIC {
            return Err(Error::corrupt(0, "bad SquashFS magic"));
        }
        let major = le16(bytes, 28);
        if major != VERSION_MAJOR {
            return Err(Error::UnsupportedFormat(format!(
                "SquashFS version {major}.{}",
                le16(bytes, 30)
            )));
        }
        let block_size = le32(bytes, 12);
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || u32::from(le16(bytes, 22)) != block_size.trailing_zeros()
        {
            return Err(Error::corrupt(12, format!("bad SquashFS block size {block_size}")));
        }
        let superblock = Self {
            block_size,
            fragment_count: le32(bytes, 16),
            compressor: Compressor::from_id(le16(bytes, 20))?,
            id_count: le16(bytes, 26),
            root_inode: le64(bytes, 32),
            bytes_used: le64(bytes, 40),
            id_table: le64(bytes, 48),
            inode_table: le64(bytes, 64),
            directory_table: le64(bytes, 72),
            fragment_table: le64(bytes, 80),
        };
        if superblock.bytes_used > len {
            return Err(Error::truncated(
                len,
                format!("SquashFS image claims {} bytes", superblock.bytes_used),
            ));
        }
        for table in [superblock.id_table, superblock.inode_table, superblock.directory_table] {
            if table >= superblock.bytes_used {
                return Err(Error::corrupt(table, "SquashFS table past the end of the image"));
            }
        }
        Ok(superblock)
    }
}

/// Block layout of a regular file.
#[derive(Debug, Clone)]
struct FileLayout {
    size: u64,
    /// Disk offset and size word of every full block.
    blocks: Vec<(u64, u32)>,
    /// Fragment index and offset of the tail.
    fragment: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Copy)]
struct Fragment {
    start: u64,
    word: u32,
}

/// A position in a metadata stream.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    block: u64,
    offset: usize,
}

struct MetadataBlock {
    data: Vec<u8>,
    next: u64,
}

/// Decoded metadata blocks, used while the image is walked.
struct Metadata<'a> {
    source: &'a dyn ByteSource,
    compressor: Compressor,
    end: u64,
    blocks: HashMap<u64, Arc<MetadataBlock>>,
}

impl Metadata<'_> {
    fn block(&mut self, at: u64) -> Result<Arc<MetadataBlock>> {
        if let Some(block) = self.blocks.get(&at) {
            return Ok(Arc::clone(block));
        }
        let header = self.source.read_vec_at(at, 2)?;
        if header.len() < 2 || at + 2 > self.end {
            return Err(Error::truncated(at, "SquashFS metadata ends early"));
        }
        let word = le16(&header, 0);
        let stored = usize::from(word & !METADATA_UNCOMPRESSED);
        if stored == 0 || stored > METADATA_SIZE {
            return Err(Error::corrupt(at, format!("bad metadata block size {stored}")));
        }
        let raw = self.source.read_vec_at(at + 2, stored)?;
        if raw.len() < stored || at + 2 + stored as u64 > self.end {
            return Err(Error::truncated(at, "SquashFS metadata block ends early"));
        }
        let data = if word & METADATA_UNCOMPRESSED != 0 {
            raw
        } else {
            self.compressor.decompress(&raw, METADATA_SIZE, at)?
        };
        let block = Arc::new(MetadataBlock {
            data,
            next: at + 2 + stored as u64,
        });
        self.blocks.insert(at, Arc::clone(&block));
        Ok(block)
    }

    fn read(&mut self, cursor: &mut Cursor, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(METADATA_SIZE * 16));
        while out.len() < len {
            let block = self.block(cursor.block)?;
            if cursor.offset > block.data.len() {
                return Err(Error::corrupt(cursor.block, "metadata offset past its block"));
            }
            if cursor.offset == block.data.len() {
                cursor.block = block.next;
                cursor.offset = 0;
                continue;
            }
            let take = (len - out.len()).min(block.data.len() - cursor.offset);
            out.extend_from_slice(&block.data[cursor.offset..cursor.offset + take]);
            cursor.offset += take;
        }
        Ok(out)
    }

    /// Reads a table of `count` fixed-size entries behind a list of block
    /// pointers at `start`.
    fn table(&mut self, start: u64, count: usize, entry_len: usize) -> Result<Vec<u8>> {
        let len = count * entry_len;
        let blocks = len.div_ceil(METADATA_SIZE);
        if start.saturating_add(blocks as u64 * 8) > self.end {
            return Err(Error::truncated(start, "SquashFS table index ends early"));
        }
        let pointers = self.source.read_vec_at(start, blocks * 8)?;
        let mut out = Vec::with_capacity(len);
        for i in 0..blocks {
            let mut cursor = Cursor {
                block: le64(&pointers, i * 8),
                offset: 0,
            };
            let want = (len - out.len()).min(METADATA_SIZE);
            out.extend(self.read(&mut cursor, want)?);
        }
        Ok(out)
    }
}

enum InodeBody {
    Directory { start_block: u32, offset: u16, listing_len: u32 },
    File(FileLayout),
    Symlink(String),
    Special,
}

struct Inode {
    body: InodeBody,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u32,
}

/// Walks the inode and directory tables.
struct Walker<'a> {
    metadata: Metadata<'a>,
    superblock: &'a Superblock,
    ids: Vec<u32>,
}

impl Walker<'_> {
    fn id(&self, index: u16, at: u64) -> Result<u32> {
        self.ids
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| Error::corrupt(at, format!("SquashFS id #{index} is not in the id table")))
    }

    fn inode(&mut self, reference: u64) -> Result<Inode> {
        let at = self.superblock.inode_table + (reference >> 16);
        let mut cursor = Cursor {
            block: at,
            offset: (reference & 0xFFFF) as usize,
        };
        let header = self.metadata.read(&mut cursor, 16)?;
        let kind = le16(&header, 0);
        let body = match kind {
            BASIC_DIRECTORY => {
                let b = self.metadata.read(&mut cursor, 16)?;
                InodeBody::Directory {
                    start_block: le32(&b, 0),
                    listing_len: u32::from(le16(&b, 8)),
                    offset: le16(&b, 10),
                }
            }
            EXTENDED_DIRECTORY => {
                let b = self.metadata.read(&mut cursor, 24)?;
                InodeBody::Directory {
                    listing_len: le32(&b, 4),
                    start_block: le32(&b, 8),
                    offset: le16(&b, 18),
                }
            }
            BASIC_FILE => {
                let b = self.metadata.read(&mut cursor, 16)?;
                let start = u64::from(le32(&b, 0));
                let size = u64::from(le32(&b, 12));
                self.file(&mut cursor, start, size, le32(&b, 4), le32(&b, 8))?
            }
            EXTENDED_FILE => {
                let b = self.metadata.read(&mut cursor, 40)?;
                self.file(&mut cursor, le64(&b, 0), le64(&b, 8), le32(&b, 28), le32(&b, 32))?
            }
            BASIC_SYMLINK | EXTENDED_SYMLINK => {
                let b = self.metadata.read(&mut cursor, 8)?;
                let len = le32(&b, 4) as usize;
                if len > MAX_LINK_TARGET {
                    return Err(Error::corrupt(at, "SquashFS link target too long"));
                }
                let target = self.metadata.read(&mut cursor, len)?;
                InodeBody::Symlink(String::from_utf8_lossy(&target).into_owned())
            }
            4..=7 | 11..=14 => InodeBody::Special,
            _ => return Err(Error::corrupt(at, format!("unknown SquashFS inode type {kind}"))),
        };
        Ok(Inode {
            body,
            mode: u32::from(le16(&header, 2)) & 0o7777,
            uid: self.id(le16(&header, 4), at)?,
            gid: self.id(le16(&header, 6), at)?,
            mtime: le32(&header, 8),
        })
    }

    fn file(
        &mut self,
        cursor: &mut Cursor,
        start: u64,
        size: u64,
        fragment: u32,
        fragment_offset: u32,
    ) -> Result<InodeBody> {
        let block_size = u64::from(self.superblock.block_size);
        let count = if fragment == NO_FRAGMENT {
            size.div_ceil(block_size)
        } else {
            size / block_size
        };
        let words = usize::try_from(count * 4)
            .map_err(|_| Error::corrupt(cursor.block, "SquashFS file too large"))?;
        let words = self.metadata.read(cursor, words)?;
        let mut at = start;
        let blocks = words
            .chunks_exact(4)
            .map(|word| {
                let word = le32(word, 0);
                let block = (at, word);
                at += u64::from(word & DATA_SIZE_MASK);
                block
            })
            .collect();
        Ok(InodeBody::File(FileLayout {
            size,
            blocks,
            fragment: (fragment != NO_FRAGMENT).then_some((fragment, fragment_offset)),
        }))
    }

    /// Names and inode references in a directory.
    fn directory(&mut self, start_block: u32, offset: u16, listing_len: u32) -> Result<Vec<(String, u64)>> {
        // The stored size counts the "." and ".." entries that are not stored.
        let len = listing_len.saturating_sub(3) as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let at = self.superblock.directory_table + u64::from(start_block);
        let mut cursor = Cursor {
            block: at,
            offset: usize::from(offset),
        };
        let data = self.metadata.read(&mut cursor, len)?;
        let bad = || Error::corrupt(at, "malformed SquashFS directory");
        let mut children = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let header = data.get(pos..pos + DIRECTORY_HEADER_LEN).ok_or_else(bad)?;
            let count = le32(header, 0) + 1;
            let start = u64::from(le32(header, 4));
            pos += DIRECTORY_HEADER_LEN;
            if count > MAX_DIRECTORY_RUN {
                return Err(bad());
            }
            for _ in 0..count {
                let entry = data.get(pos..pos + DIRECTORY_ENTRY_LEN).ok_or_else(bad)?;
                let inode_offset = u64::from(le16(entry, 0));
                let name_len = usize::from(le16(entry, 6)) + 1;
                pos += DIRECTORY_ENTRY_LEN;
                let name = data.get(pos..pos + name_len).ok_or_else(bad)?;
                pos += name_len;
                if name == b"." || name == b".." || name.contains(&b'/') || name.contains(&0) {
                    return Err(Error::corrupt(at, "invalid name in SquashFS directory"));
                }
                let name = String::from_utf8_lossy(name).into_owned();
                children.push((name, (start << 16) | inode_offset));
            }
        }
        Ok(children)
    }

    /// Lists every path below the root directory.
    fn walk(&mut self) -> Result<(Vec<ForeignEntry>, Vec<FileLayout>)> {
        let root_reference = self.superblock.root_inode;
        let root = self.inode(root_reference)?;
        let InodeBody::Directory {
            start_block,
            offset,
            listing_len,
        } = root.body
        else {
            return Err(Error::corrupt(
                self.superblock.inode_table,
                "SquashFS root is not a directory",
            ));
        };
        let mut entries = Vec::new();
        let mut files = Vec::new();
        let mut visited = HashSet::from([root_reference]);
        let mut pending = vec![(String::new(), start_block, offset, listing_len)];
        while let Some((prefix, start_block, offset, listing_len)) = pending.pop() {
            let mut subdirectories = Vec::new();
            for (name, reference) in self.directory(start_block, offset, listing_len)? {
                let path = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                let inode = self.inode(reference)?;
                let (kind, size, locator) = match inode.body {
                    InodeBody::Directory {
                        start_block,
                        offset,
                        listing_len,
                    } => {
                        if !visited.insert(reference) {
                            return Err(Error::corrupt(
                                self.superblock.inode_table + (reference >> 16),
                                "SquashFS directory cycle",
                            ));
                        }
                        subdirectories.push((path.clone(), start_block, offset, listing_len));
                        (EntryKind::Directory, 0, u64::MAX)
                    }
                    InodeBody::File(layout) => {
                        let size = layout.size;
                        files.push(layout);
                        (EntryKind::File, size, files.len() as u64 - 1)
                    }
                    InodeBody::Symlink(target) => (EntryKind::Symlink { target }, 0, u64::MAX),
                    InodeBody::Special => (EntryKind::File, 0, u64::MAX),
                };
                entries.push(ForeignEntry {
                    path,
                    kind,
                    size,
                    mode: inode.mode,
                    mtime: Timestamp::from_unix_secs(i64::from(inode.mtime)),
                    ownership: Ownership::from_ids(inode.uid, inode.gid),
                    locator,
                });
            }
            pending.extend(subdirectories.into_iter().rev());
        }
        Ok((entries, files))
    }
}

type Walked = (Vec<ForeignEntry>, Vec<FileLayout>, Vec<Fragment>);

/// Reads the id and fragment tables, then lists the tree.
fn walk_image(source: &dyn ByteSource, superblock: &Superblock) -> Result<Walked> {
    let mut metadata = Metadata {
        source,
        compressor: superblock.compressor,
        end: superblock.bytes_used,
        blocks: HashMap::new(),
    };
    let ids = metadata
        .table(superblock.id_table, usize::from(superblock.id_count), 4)?
        .chunks_exact(4)
        .map(|id| le32(id, 0))
        .collect();
    let fragments = if superblock.fragment_count == 0 || superblock.fragment_table == NOT_PRESENT {
        Vec::new()
    } else {
        metadata
            .table(superblock.fragment_table, superblock.fragment_count as usize, 16)?
            .chunks_exact(16)
            .map(|entry| Fragment {
                start: le64(entry, 0),
                word: le32(entry, 8),
            })
            .collect()
    };
    let mut walker = Walker {
        metadata,
        superblock,
        ids,
    };
    let (entries, files) = walker.walk()?;
    Ok((entries, files, fragments))
}

/// A SquashFS image read through a [`ByteSource`].
pub struct SquashfsArchive {
    source: Arc<dyn ByteSource>,
    compressor: Compressor,
    block_size: u32,
    end: u64,
    entries: Vec<ForeignEntry>,
    files: Vec<FileLayout>,
    fragments: Vec<Fragment>,
    /// Last decoded data or fragment block, by disk offset.
    cache: Mutex<Option<(u64, Arc<Vec<u8>>)>>,
}

impl fmt::Debug for SquashfsArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SquashfsArchive")
            .field("len", &self.source.len())
            .field("compressor", &self.compressor)
            .field("block_size", &self.block_size)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl SquashfsArchive {
    /// Reads the superblock and walks the directory tree of the image in
    /// `source`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for malformed images and
    /// [`Error::UnsupportedFormat`] for other versions or compressors that
    /// are not built in.
    pub fn open(source: Arc<dyn ByteSource>) -> Result<Self> {
        let head = source.read_vec_at(0, SUPERBLOCK_LEN)?;
        let superblock = Superblock::parse(&head, source.len())?;
        let (entries, files, fragments) = walk_image(source.as_ref(), &superblock)?;
        Ok(Self {
            compressor: superblock.compressor,
            block_size: superblock.block_size,
            end: superblock.bytes_used,
            source,
            entries,
            files,
            fragments,
            cache: Mutex::new(None),
        })
    }

    /// Number of listed paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the image holds nothing but its root.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reads and decodes the block stored at `at`.
    fn data_block(&self, at: u64, word: u32) -> Result<Arc<Vec<u8>>> {
        let mut slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached, data)) = slot.as_ref() {
            if *cached == at {
                return Ok(Arc::clone(data));
            }
        }
        let stored = word & DATA_SIZE_MASK;
        if stored > self.block_size {
            return Err(Error::corrupt(at, format!("bad data block size {stored}")));
        }
        let raw = self.source.read_vec_at(at, stored as usize)?;
        if raw.len() < stored as usize || at + u64::from(stored) > self.end {
            return Err(Error::truncated(at, "SquashFS data block ends early"));
        }
        let data = if word & DATA_UNCOMPRESSED != 0 {
            raw
        } else {
            self.compressor.decompress(&raw, self.block_size as usize, at)?
        };
        let data = Arc::new(data);
        *slot = Some((at, Arc::clone(&data)));
        Ok(data)
    }

    /// The bytes of block `index` of a file.
    fn file_block(&self, layout: &FileLayout, index: u64) -> Result<(Arc<Vec<u8>>, Range<usize>)> {
        let block_size = u64::from(self.block_size);
        let expected = (layout.size - index * block_size).min(block_size) as usize;
        if let Some(&(at, word)) = usize::try_from(index).ok().and_then(|i| layout.blocks.get(i)) {
            if word & DATA_SIZE_MASK == 0 {
                return Ok((Arc::new(vec![0u8; expected]), 0..expected));
            }
            let data = self.data_block(at, word)?;
            if data.len() < expected {
                return Err(Error::corrupt(at, "SquashFS data block is short"));
            }
            return Ok((data, 0..expected));
        }
        let (fragment, offset) = layout
            .fragment
            .ok_or_else(|| Error::corrupt(0, format!("SquashFS file has no block #{index}")))?;
        let entry = self
            .fragments
            .get(fragment as usize)
            .ok_or_else(|| Error::corrupt(0, format!("SquashFS fragment #{fragment} is missing")))?;
        let data = self.data_block(entry.start, entry.word)?;
        let range = offset as usize..offset as usize + expected;
        if range.end > data.len() {
            return Err(Error::corrupt(entry.start, "SquashFS fragment is short"));
        }
        Ok((data, range))
    }
}

impl ForeignArchive for SquashfsArchive {
    fn format_name(&self) -> &'static str {
        "squashfs"
    }

    fn list(&self) -> Result<Vec<ForeignEntry>> {
        Ok(self.entries.clone())
    }

    fn extract(&self, entry: &ForeignEntry, offset: u64, len: usize) -> Result<Vec<u8>> {
        let layout = usize::try_from(entry.locator)
            .ok()
            .and_then(|i| self.files.get(i))
            .ok_or_else(|| Error::InvalidArchivePath(format!("no SquashFS file #{}", entry.locator)))?;
        let len = clamp_read(layout.size, offset, len);
        let block_size = u64::from(self.block_size);
        let end = offset + len as u64;
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while pos < end {
            let index = pos / block_size;
            let (data, range) = self.file_block(layout, index)?;
            let start = range.start + (pos - index * block_size) as usize;
            let take = ((end - pos) as usize).min(range.end - start);
            out.extend_from_slice(&data[start..start + take]);
            pos += take as u64;
        }
        Ok(out)
    }
}
