//! Persisted indexes.
//!
//! A built index is written to an SQLite database so later mounts of the same
//! archive skip the scan. The database records the archive's identity (path,
//! size, modification time and an optional content fingerprint); an index
//! whose identity no longer matches is stale and is rebuilt. An uncompressed
//! tar that only grew at the end keeps its index and is scanned from where
//! the previous scan stopped.
//!
//! # Schema
//!
//! | Table | Columns |
//! |-------|---------|
//! | `metadata` | `key`, `value` |
//! | `entries` | `occurrence`, `path`, `kind`, `link_target`, `size`, `mode`, `uid`, `gid`, `uname`, `gname`, `mtime`, `content_offset`, `header_offset`, `source_id`, `sparse` |
//! | `checkpoints` | `decompressed_offset`, `compressed_offset`, `state` |

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};
use rusqlite::{Connection, OpenFlags, params};

use crate::checkpoint::{Checkpoint, CheckpointList, CodecState};
use crate::codec::CodecKind;
use crate::config::{IndexLocation, IndexOptions};
use crate::index::{Entry, EntryKind, Index, SparseMap};
use crate::io::ByteSource;
use crate::ownership::Ownership;
use crate::tar::BuiltIndex;
use crate::timestamp::Timestamp;
use crate::{Error, READ_BUFFER_SIZE, Result};

/// Version of the database layout. Indexes written with another version are rebuilt.
pub const SCHEMA_VERSION: &str = "2";

/// Suffix of index files stored next to their archive.
pub const INDEX_SUFFIX: &str = ".index.sqlite";

/// Bytes hashed at each end of the archive for the content fingerprint.
const FINGERPRINT_WINDOW: u64 = 64 * 1024;

const SCHEMA: &str = "
CREATE TABLE metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE entries (
    occurrence     INTEGER PRIMARY KEY,
    path           TEXT NOT NULL,
    kind           TEXT NOT NULL,
    link_target    TEXT,
    size           INTEGER NOT NULL,
    mode           INTEGER NOT NULL,
    uid            INTEGER NOT NULL,
    gid            INTEGER NOT NULL,
    uname          TEXT,
    gname          TEXT,
    mtime          INTEGER NOT NULL,
    content_offset INTEGER NOT NULL,
    header_offset  INTEGER NOT NULL,
    source_id      INTEGER NOT NULL,
    sparse         BLOB
);
CREATE INDEX entries_by_path ON entries (path);
CREATE TABLE checkpoints (
    decompressed_offset INTEGER PRIMARY KEY,
    compressed_offset   INTEGER NOT NULL,
    state               BLOB NOT NULL
);
";

/// What makes two archive files "the same archive".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIdentity {
    /// Absolute path of the archive.
    pub path: PathBuf,
    /// Length in bytes.
    pub size: u64,
    /// Modification time.
    pub mtime: Timestamp,
    /// CRC-32 of the first and last 64 KiB, if requested.
    pub fingerprint: Option<u32>,
}

impl ArchiveIdentity {
    /// Reads the identity of the archive at `path`, whose bytes are `source`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file metadata or the fingerprinted ranges
    /// cannot be read.
    pub fn of_file(path: &Path, source: &dyn ByteSource, with_fingerprint: bool) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        let mtime = metadata
            .modified()
            .map(Timestamp::from)
            .unwrap_or(Timestamp::EPOCH);
        let fingerprint = if with_fingerprint {
            Some(fingerprint(source, source.len())?)
        } else {
            None
        };
        Ok(Self {
            path: fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
            size: source.len(),
            mtime,
            fingerprint,
        })
    }
}

/// CRC-32 over the first and the last 64 KiB of the first `len` bytes.
fn fingerprint(source: &dyn ByteSource, len: u64) -> io::Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    if len <= 2 * FINGERPRINT_WINDOW {
        hasher.update(&source.read_vec_at(0, len as usize)?);
    } else {
        hasher.update(&source.read_vec_at(0, FINGERPRINT_WINDOW as usize)?);
        hasher.update(&source.read_vec_at(len - FINGERPRINT_WINDOW, FINGERPRINT_WINDOW as usize)?);
    }
    Ok(hasher.finalize())
}

/// CRC-32 of every byte in `[0, len)`.
///
/// An append-only update must leave all of them untouched, so a change
/// anywhere before `len` gives a different hash.
fn head_hash(source: &dyn ByteSource, len: u64) -> io::Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE * 16];
    let mut offset = 0;
    while offset < len {
        let want = (len - offset).min(buf.len() as u64) as usize;
        source.read_exact_at(offset, &mut buf[..want])?;
        hasher.update(&buf[..want]);
        offset += want as u64;
    }
    Ok(hasher.finalize())
}

/// Which kind of index a database holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKey {
    /// Source kind that built the index (`"tar"` or `"compressed"`).
    pub backend: &'static str,
    /// Codec of the archive's outer stream.
    pub codec: CodecKind,
    /// Indexing options that change the index contents.
    pub arguments: String,
}

/// Outcome of looking for a persisted index.
#[derive(Debug)]
pub enum IndexLookup {
    /// The index matches the archive.
    Fresh(BuiltIndex),
    /// The archive is an uncompressed tar that grew; the index covers its
    /// old contents and the scan should continue at `scan_end`.
    Appended(BuiltIndex),
    /// No usable index was found.
    Missing,
}

/// Reads and writes persisted indexes.
#[derive(Debug, Clone)]
pub struct IndexStore {
    options: IndexOptions,
}

impl IndexStore {
    /// Creates a store with the given options.
    pub fn new(options: IndexOptions) -> Self {
        Self { options }
    }

    /// The store's options.
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Index file locations for `archive`, in lookup order.
    pub fn candidates(&self, archive: &Path) -> Vec<PathBuf> {
        match &self.options.location {
            IndexLocation::Memory => Vec::new(),
            IndexLocation::File(path) => vec![path.clone()],
            IndexLocation::Beside => {
                let mut name = archive.as_os_str().to_os_string();
                name.push(INDEX_SUFFIX);
                let mut paths = vec![PathBuf::from(name)];
                let flattened = archive
                    .to_string_lossy()
                    .trim_start_matches(['/', '\\'])
                    .replace(['/', '\\', ':'], "_");
                for folder in &self.options.index_folders {
                    paths.push(folder.join(format!("{flattened}{INDEX_SUFFIX}")));
                }
                paths
            }
        }
    }

    /// Deletes every existing index file of `archive`.
    pub fn clear(&self, archive: &Path) {
        for candidate in self.candidates(archive) {
            match fs::remove_file(&candidate) {
                Ok(()) => info!("removed index {}", candidate.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("cannot remove index {}: {e}", candidate.display()),
            }
        }
    }

    /// Looks for a persisted index matching `identity`.
    ///
    /// Stale and unreadable index files are reported in the log and skipped;
    /// they never fail the lookup.
    pub fn load(
        &self,
        identity: &ArchiveIdentity,
        source: &dyn ByteSource,
        key: &StoreKey,
        source_id: u32,
    ) -> IndexLookup {
        for candidate in self.candidates(&identity.path) {
            if !candidate.is_file() {
                continue;
            }
            let started = Instant::now();
            match self.load_from(&candidate, identity, source, key, source_id) {
                Ok(lookup) => {
                    info!(
                        "loaded index {} in {:.2?}",
                        candidate.display(),
                        started.elapsed()
                    );
                    return lookup;
                }
                Err(Error::StaleIndex(reason)) => {
                    info!("index {} is stale ({reason}); rebuilding", candidate.display());
                }
                Err(e) => warn!("ignoring unusable index {}: {e}", candidate.display()),
            }
        }
        IndexLookup::Missing
    }

    fn load_from(
        &self,
        path: &Path,
        identity: &ArchiveIdentity,
        source: &dyn ByteSource,
        key: &StoreKey,
        source_id: u32,
    ) -> Result<IndexLookup> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let metadata = read_metadata(&conn)?;
        let get = |name: &str| -> Result<&str> {
            metadata
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| Error::InvalidIndex(format!("missing metadata `{name}`")))
        };
        let number = |name: &str| -> Result<i64> {
            get(name)?
                .parse()
                .map_err(|_| Error::InvalidIndex(format!("metadata `{name}` is not a number")))
        };

        let version = get("schema_version")?;
        if version != SCHEMA_VERSION {
            return Err(Error::StaleIndex(format!(
                "schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }
        if get("backend")? != key.backend || get("codec")? != key.codec.name() {
            return Err(Error::StaleIndex("built for another archive type".into()));
        }
        if get("arguments")? != key.arguments {
            return Err(Error::StaleIndex("built with other indexing options".into()));
        }

        let stored_size = from_sql(number("archive_size")?)?;
        let appended = if stored_size == identity.size {
            false
        } else if self.is_appended(&metadata, identity, source, key, stored_size)? {
            true
        } else {
            return Err(Error::StaleIndex(format!(
                "archive size changed from {stored_size} to {}",
                identity.size
            )));
        };

        if !appended {
            if self.options.verify_mtime
                && number("archive_mtime")? != identity.mtime.as_unix_nanos()
            {
                return Err(Error::StaleIndex("archive modification time changed".into()));
            }
            let stored_hash = metadata
                .get("content_hash")
                .and_then(|h| h.parse::<u32>().ok());
            if let (Some(stored), Some(current)) = (stored_hash, identity.fingerprint) {
                if stored != current {
                    return Err(Error::StaleIndex("archive contents changed".into()));
                }
            }
        }

        let built = BuiltIndex {
            index: read_entries(&conn, source_id)?,
            checkpoints: read_checkpoints(&conn)?,
            decoded_len: from_sql(number("decoded_len")?)?,
            scan_end: from_sql(number("scan_end")?)?,
        };
        Ok(if appended {
            IndexLookup::Appended(built)
        } else {
            IndexLookup::Fresh(built)
        })
    }

    /// An uncompressed tar that only grew keeps its old bytes unchanged.
    fn is_appended(
        &self,
        metadata: &HashMap<String, String>,
        identity: &ArchiveIdentity,
        source: &dyn ByteSource,
        key: &StoreKey,
        stored_size: u64,
    ) -> Result<bool> {
        if key.backend != "tar" || key.codec != CodecKind::Identity || identity.size < stored_size {
            return Ok(false);
        }
        let Some(stored) = metadata.get("head_hash").and_then(|h| h.parse::<u32>().ok()) else {
            return Ok(false);
        };
        // Appending rewrites the end-of-archive blocks, so only the records
        // before them must be unchanged.
        let Some(scan_end) = metadata.get("scan_end").and_then(|v| v.parse::<u64>().ok()) else {
            return Ok(false);
        };
        if scan_end > identity.size {
            return Ok(false);
        }
        Ok(head_hash(source, scan_end)? == stored)
    }

    /// Persists `built` if the options allow it.
    ///
    /// Returns the written path, or `None` if nothing was written. Failing
    /// locations are logged and the next candidate is tried.
    ///
    /// # Errors
    ///
    /// Returns an error only if the archive itself cannot be read for the
    /// identity hashes.
    pub fn save(
        &self,
        identity: &ArchiveIdentity,
        source: &dyn ByteSource,
        key: &StoreKey,
        built: &BuiltIndex,
    ) -> Result<Option<PathBuf>> {
        if !self.options.write_index {
            return Ok(None);
        }
        if built.index.len() < self.options.min_entry_count {
            debug!(
                "not persisting index of {} with {} entries (minimum {})",
                identity.path.display(),
                built.index.len(),
                self.options.min_entry_count
            );
            return Ok(None);
        }

        let mut metadata = vec![
            ("schema_version", SCHEMA_VERSION.to_string()),
            ("backend", key.backend.to_string()),
            ("codec", key.codec.name().to_string()),
            ("arguments", key.arguments.clone()),
            ("archive_path", identity.path.to_string_lossy().into_owned()),
            ("archive_size", identity.size.to_string()),
            ("archive_mtime", identity.mtime.as_unix_nanos().to_string()),
            ("head_hash", head_hash(source, built.scan_end)?.to_string()),
            ("decoded_len", built.decoded_len.to_string()),
            ("scan_end", built.scan_end.to_string()),
        ];
        if let Some(hash) = identity.fingerprint {
            metadata.push(("content_hash", hash.to_string()));
        }

        for candidate in self.candidates(&identity.path) {
            let started = Instant::now();
            match write_index(&candidate, &metadata, built) {
                Ok(()) => {
                    info!(
                        "wrote index {} in {:.2?}",
                        candidate.display(),
                        started.elapsed()
                    );
                    return Ok(Some(candidate));
                }
                Err(e) => warn!("cannot write index {}: {e}", candidate.display()),
            }
        }
        Ok(None)
    }
}

fn to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidIndex(format!("value {value} out of range")))
}

fn from_sql(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::InvalidIndex(format!("negative value {value}")))
}

fn read_metadata(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM metadata")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut metadata = HashMap::new();
    for row in rows {
        let (key, value): (String, String) = row?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn read_entries(conn: &Connection, source_id: u32) -> Result<Index> {
    let mut stmt = conn.prepare(
        "SELECT occurrence, path, kind, link_target, size, mode, uid, gid, uname, gname,
                mtime, content_offset, header_offset, sparse
         FROM entries ORDER BY occurrence",
    )?;
    let mut rows = stmt.query([])?;
    let mut index = Index::new();
    while let Some(row) = rows.next()? {
        let kind_name: String = row.get(2)?;
        let link_target: Option<String> = row.get(3)?;
        let kind = EntryKind::from_name(&kind_name, link_target)
            .ok_or_else(|| Error::InvalidIndex(format!("unknown entry kind `{kind_name}`")))?;
        let uname: Option<String> = row.get(8)?;
        let gname: Option<String> = row.get(9)?;
        let id = |value: i64| {
            u32::try_from(value).map_err(|_| Error::InvalidIndex(format!("invalid id {value}")))
        };
        let ownership = Ownership::from_ids(id(row.get(6)?)?, id(row.get(7)?)?)
            .with_names(uname.unwrap_or_default(), gname.unwrap_or_default());
        let size = from_sql(row.get(4)?)?;
        let sparse = match row.get::<_, Option<Vec<u8>>>(13)? {
            Some(bytes) => Some(
                SparseMap::from_bytes(&bytes, size)
                    .ok_or_else(|| Error::InvalidIndex("malformed sparse map".into()))?,
            ),
            None => None,
        };
        index.insert(Entry {
            occurrence: from_sql(row.get(0)?)?,
            path: row.get(1)?,
            kind,
            size,
            mode: id(row.get(5)?)?,
            ownership,
            mtime: Timestamp::from_unix_nanos(row.get(10)?),
            content_offset: from_sql(row.get(11)?)?,
            header_offset: from_sql(row.get(12)?)?,
            source_id,
            synthetic: false,
            sparse,
        });
    }
    Ok(index)
}

fn read_checkpoints(conn: &Connection) -> Result<CheckpointList> {
    let mut stmt = conn.prepare(
        "SELECT compressed_offset, decompressed_offset, state
         FROM checkpoints ORDER BY decompressed_offset",
    )?;
    let mut rows = stmt.query([])?;
    let mut points = Vec::new();
    while let Some(row) = rows.next()? {
        points.push(Checkpoint {
            compressed_offset: from_sql(row.get(0)?)?,
            decompressed_offset: from_sql(row.get(1)?)?,
            state: CodecState::from_bytes(row.get(2)?),
        });
    }
    CheckpointList::from_vec(points)
}

/// Writes a complete index next to `path` and moves it into place.
fn write_index(path: &Path, metadata: &[(&str, String)], built: &BuiltIndex) -> Result<()> {
    let mut partial = path.as_os_str().to_os_string();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    let _ = fs::remove_file(&partial);

    let result = write_database(&partial, metadata, built)
        .and_then(|()| fs::rename(&partial, path).map_err(Error::from));
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn write_database(path: &Path, metadata: &[(&str, String)], built: &BuiltIndex) -> Result<()> {
    let mut conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    let tx = conn.transaction()?;
    {
        let mut insert = tx.prepare("INSERT INTO metadata (key, value) VALUES (?1, ?2)")?;
        for (key, value) in metadata {
            insert.execute(params![key, value])?;
        }

        let mut insert = tx.prepare(
            "INSERT INTO entries (occurrence, path, kind, link_target, size, mode, uid, gid,
                                  uname, gname, mtime, content_offset, header_offset, source_id,
                                  sparse)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )?;
        for entry in built.index.recorded_entries() {
            insert.execute(params![
                to_sql(entry.occurrence)?,
                entry.path,
                entry.kind.name(),
                entry.link_target(),
                to_sql(entry.size)?,
                entry.mode,
                entry.ownership.uid,
                entry.ownership.gid,
                entry.ownership.user_name,
                entry.ownership.group_name,
                entry.mtime.as_unix_nanos(),
                to_sql(entry.content_offset)?,
                to_sql(entry.header_offset)?,
                entry.source_id,
                entry.sparse.as_ref().map(SparseMap::to_bytes),
            ])?;
        }

        let mut insert = tx.prepare(
            "INSERT INTO checkpoints (decompressed_offset, compressed_offset, state)
             VALUES (?1, ?2, ?3)",
        )?;
        for checkpoint in built.checkpoints.to_vec() {
            insert.execute(params![
                to_sql(checkpoint.decompressed_offset)?,
                to_sql(checkpoint.compressed_offset)?,
                checkpoint.state.as_bytes(),
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::index::SparseSegment;
    use crate::io::MemorySource;
    use crate::tar::IndexBuilder;
    use std::sync::Arc;

    fn sample_tar(files: usize) -> Vec<u8> {
        let mut tar = tar::Builder::new(Vec::new());
        for i in 0..files {
            let data = format!("content of file {i}");
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o640);
            header.set_mtime(1_600_000_000 + i as u64);
            header.set_uid(1000);
            header.set_gid(1000);
            header.set_username("alice").unwrap();
            tar.append_data(&mut header, format!("dir{}/file{i}.txt", i % 3), data.as_bytes())
                .unwrap();
        }
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_entry_type(tar::EntryType::Symlink);
        tar.append_link(&mut header, "latest", "dir0/file0.txt").unwrap();
        tar.into_inner().unwrap()
    }

    fn build(bytes: &[u8]) -> BuiltIndex {
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(bytes.to_vec()));
        let decoder = CodecKind::Identity.codec().unwrap().open_decoder(source).unwrap();
        IndexBuilder::new(&MountConfig::default())
            .unwrap()
            .build(decoder)
            .unwrap()
    }

    fn key() -> StoreKey {
        StoreKey {
            backend: "tar",
            codec: CodecKind::Identity,
            arguments: String::new(),
        }
    }

    fn options() -> IndexOptions {
        IndexOptions {
            min_entry_count: 0,
            ..IndexOptions::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        archive: PathBuf,
        bytes: Vec<u8>,
    }

    impl Fixture {
        fn new(files: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let archive = fs::canonicalize(dir.path()).unwrap().join("sample.tar");
            let bytes = sample_tar(files);
            fs::write(&archive, &bytes).unwrap();
            Self {
                _dir: dir,
                archive,
                bytes,
            }
        }

        fn source(&self) -> MemorySource {
            MemorySource::new(fs::read(&self.archive).unwrap())
        }

        fn identity(&self, fingerprint: bool) -> ArchiveIdentity {
            ArchiveIdentity::of_file(&self.archive, &self.source(), fingerprint).unwrap()
        }
    }

    fn recorded(index: &Index) -> Vec<Entry> {
        index
            .recorded_entries()
            .iter()
            .map(|e| Entry::clone(e))
            .collect()
    }

    #[test]
    fn test_save_and_reload_matches_built_index() {
        let fixture = Fixture::new(20);
        let store = IndexStore::new(options());
        let built = build(&fixture.bytes);
        let identity = fixture.identity(true);

        let written = store
            .save(&identity, &fixture.source(), &key(), &built)
            .unwrap()
            .unwrap();
        assert!(written.to_string_lossy().ends_with("sample.tar.index.sqlite"));

        let IndexLookup::Fresh(loaded) = store.load(&identity, &fixture.source(), &key(), 0) else {
            panic!("expected a fresh index");
        };
        assert_eq!(recorded(&loaded.index), recorded(&built.index));
        assert_eq!(loaded.checkpoints.to_vec(), built.checkpoints.to_vec());
        assert_eq!(loaded.decoded_len, built.decoded_len);
        assert_eq!(loaded.scan_end, built.scan_end);
        assert_eq!(
            loaded.index.current("latest").unwrap().link_target(),
            Some("dir0/file0.txt")
        );
        assert_eq!(
            loaded.index.current("dir1/file1.txt").unwrap().ownership.user_name.as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn test_head_hash_covers_the_whole_prefix() {
        let original: Vec<u8> = (0..3_000_000u32).map(|i| (i % 253) as u8).collect();
        let mut changed = original.clone();
        changed[2_500_000] ^= 1;
        let hash = |bytes: &[u8], len| head_hash(&MemorySource::new(bytes.to_vec()), len).unwrap();
        assert_ne!(hash(&original, 2_600_000), hash(&changed, 2_600_000));
        assert_eq!(hash(&original, 2_400_000), hash(&changed, 2_400_000));
        assert_eq!(hash(&original, 0), crc32fast::hash(&[]));
    }

    #[test]
    fn test_sparse_maps_survive_a_reload() {
        let fixture = Fixture::new(3);
        let store = IndexStore::new(options());
        let mut built = build(&fixture.bytes);
        let segments = vec![
            SparseSegment { offset: 4096, len: 10 },
            SparseSegment { offset: 1 << 32, len: 3 },
        ];
        let map = SparseMap::new(segments, 1 << 33).unwrap();
        let occurrence = built.index.next_occurrence();
        built.index.insert(Entry {
            path: "disk.img".into(),
            kind: EntryKind::File,
            size: 1 << 33,
            mode: crate::index::S_IFREG | 0o644,
            ownership: Ownership::default(),
            mtime: Timestamp::EPOCH,
            content_offset: 512,
            header_offset: 0,
            source_id: 0,
            occurrence,
            synthetic: false,
            sparse: Some(map.clone()),
        });
        let identity = fixture.identity(false);
        store.save(&identity, &fixture.source(), &key(), &built).unwrap();

        let IndexLookup::Fresh(loaded) = store.load(&identity, &fixture.source(), &key(), 0) else {
            panic!("expected a fresh index");
        };
        assert_eq!(loaded.index.current("disk.img").unwrap().sparse, Some(map));
        assert!(loaded.index.current("latest").unwrap().sparse.is_none());
    }

    #[test]
    fn test_changed_identity_is_stale() {
        let fixture = Fixture::new(5);
        let store = IndexStore::new(options());
        let identity = fixture.identity(false);
        store
            .save(&identity, &fixture.source(), &key(), &build(&fixture.bytes))
            .unwrap();

        let mut touched = identity.clone();
        touched.mtime = Timestamp::from_unix_secs(identity.mtime.secs() + 60);
        assert!(matches!(
            store.load(&touched, &fixture.source(), &key(), 0),
            IndexLookup::Missing
        ));

        let relaxed = IndexStore::new(IndexOptions {
            verify_mtime: false,
            ..options()
        });
        assert!(matches!(
            relaxed.load(&touched, &fixture.source(), &key(), 0),
            IndexLookup::Fresh(_)
        ));

        let other_args = StoreKey {
            arguments: "oci_whiteouts=true".into(),
            ..key()
        };
        assert!(matches!(
            store.load(&identity, &fixture.source(), &other_args, 0),
            IndexLookup::Missing
        ));
    }

    #[test]
    fn test_fingerprint_mismatch_is_stale() {
        let fixture = Fixture::new(5);
        let store = IndexStore::new(options());
        let identity = fixture.identity(true);
        store
            .save(&identity, &fixture.source(), &key(), &build(&fixture.bytes))
            .unwrap();

        let mut changed = identity.clone();
        changed.fingerprint = identity.fingerprint.map(|h| h ^ 1);
        assert!(matches!(
            store.load(&changed, &fixture.source(), &key(), 0),
            IndexLookup::Missing
        ));
    }

    #[test]
    fn test_schema_version_mismatch_is_stale() {
        let fixture = Fixture::new(5);
        let store = IndexStore::new(options());
        let identity = fixture.identity(false);
        let path = store
            .save(&identity, &fixture.source(), &key(), &build(&fixture.bytes))
            .unwrap()
            .unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE metadata SET value = '0' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        drop(conn);

        assert!(matches!(
            store.load(&identity, &fixture.source(), &key(), 0),
            IndexLookup::Missing
        ));
    }

    #[test]
    fn test_garbage_index_file_is_ignored() {
        let fixture = Fixture::new(3);
        let store = IndexStore::new(options());
        let candidate = &store.candidates(&fixture.archive)[0];
        fs::write(candidate, b"definitely not sqlite").unwrap();
        assert!(matches!(
            store.load(&fixture.identity(false), &fixture.source(), &key(), 0),
            IndexLookup::Missing
        ));
    }

    #[test]
    fn test_small_indexes_are_not_written() {
        let fixture = Fixture::new(3);
        let store = IndexStore::new(IndexOptions::default());
        let written = store
            .save(
                &fixture.identity(false),
                &fixture.source(),
                &key(),
                &build(&fixture.bytes),
            )
            .unwrap();
        assert!(written.is_none());
        assert!(!store.candidates(&fixture.archive)[0].exists());
    }

    #[test]
    fn test_memory_location_never_touches_disk() {
        let fixture = Fixture::new(3);
        let store = IndexStore::new(IndexOptions::in_memory());
        assert!(store.candidates(&fixture.archive).is_empty());
        assert!(
            store
                .save(
                    &fixture.identity(false),
                    &fixture.source(),
                    &key(),
                    &build(&fixture.bytes)
                )
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_index_folder_fallback() {
        let fixture = Fixture::new(4);
        let folder = tempfile::tempdir().unwrap();
        let store = IndexStore::new(IndexOptions {
            location: IndexLocation::Beside,
            index_folders: vec![PathBuf::from("/nonexistent/seekstone"), folder.path().into()],
            ..options()
        });
        let candidates = store.candidates(&fixture.archive);
        assert_eq!(candidates.len(), 3);
        assert!(candidates[2].starts_with(folder.path()));

        // Make the archive's own directory unusable by occupying the index path
        // with a directory.
        fs::create_dir(&candidates[0]).unwrap();
        let identity = fixture.identity(false);
        let written = store
            .save(&identity, &fixture.source(), &key(), &build(&fixture.bytes))
            .unwrap()
            .unwrap();
        assert_eq!(written, candidates[2]);
        assert!(matches!(
            store.load(&identity, &fixture.source(), &key(), 0),
            IndexLookup::Fresh(_)
        ));
    }

    #[test]
    fn test_appended_tar_is_detected() {
        let fixture = Fixture::new(4);
        let store = IndexStore::new(options());
        let built = build(&fixture.bytes);
        let identity = fixture.identity(false);
        store
            .save(&identity, &fixture.source(), &key(), &built)
            .unwrap();

        let mut grown_bytes = fixture.bytes.clone();
        grown_bytes.extend_from_slice(&[0u8; 10240]);
        let grown = MemorySource::new(grown_bytes);
        let grown_identity = ArchiveIdentity {
            size: grown.len(),
            mtime: Timestamp::from_unix_secs(identity.mtime.secs() + 5),
            ..identity.clone()
        };
        let IndexLookup::Appended(previous) = store.load(&grown_identity, &grown, &key(), 0) else {
            panic!("expected an appended index");
        };
        assert_eq!(previous.scan_end, built.scan_end);

        // A compressed archive that changed size is simply stale.
        let gzip_key = StoreKey {
            codec: CodecKind::Gzip,
            ..key()
        };
        assert!(matches!(
            store.load(&grown_identity, &grown, &gzip_key, 0),
            IndexLookup::Missing
        ));
    }

    #[test]
    fn test_clear_removes_index() {
        let fixture = Fixture::new(3);
        let store = IndexStore::new(options());
        let identity = fixture.identity(false);
        let path = store
            .save(&identity, &fixture.source(), &key(), &build(&fixture.bytes))
            .unwrap()
            .unwrap();
        assert!(path.exists());
        store.clear(&fixture.archive);
        assert!(!path.exists());
    }
}
