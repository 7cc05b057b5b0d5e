//! Tests for persisted indexes.
//!
//! A loaded index is told apart from a fresh scan by damaging the archive
//! in place while keeping its size and modification time: a scan trips over
//! the damage, a loaded index does not look at it.

mod common;

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use common::{children, persisted_index, tar_files, write_archive};
use seekstone::{IndexLocation, IndexOptions, MountConfig, MountContext, MountSource, Threads};

fn config(index: IndexOptions) -> MountConfig {
    MountConfig::new().threads(Threads::Single).index(index)
}

fn sample() -> Vec<u8> {
    tar_files(&[
        ("docs/one.txt", b"one"),
        ("docs/two.txt", b"two two"),
        ("three.txt", b"three three three"),
    ])
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

/// Flips a byte of the second header and restores the modification time.
fn damage_second_header(path: &Path) {
    let mtime = modified(path);
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(1024 + 20)).unwrap();
    file.write_all(&[0x5A]).unwrap();
    file.set_modified(mtime).unwrap();
}

fn set_mtime(path: &Path, mtime: SystemTime) {
    OpenOptions::new()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
}

fn index_file(archive: &Path) -> std::path::PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".index.sqlite");
    name.into()
}

#[test]
fn reload_skips_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), "sample.tar", &sample());

    let first = MountContext::new(config(persisted_index())).unwrap();
    let built = first.open_archive(&archive).unwrap();
    assert!(index_file(&archive).is_file());

    damage_second_header(&archive);

    let second = MountContext::new(config(persisted_index())).unwrap();
    let loaded = second.open_archive(&archive).unwrap();
    assert_eq!(children(&*loaded, ""), children(&*built, ""));
    assert_eq!(children(&*loaded, "docs"), ["one.txt", "two.txt"]);
    assert_eq!(loaded.stat("three.txt").unwrap(), built.stat("three.txt").unwrap());
    assert_eq!(loaded.read_file("three.txt", 6, 5).unwrap(), b"three");
}

#[test]
fn changed_mtime_forces_a_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), "sample.tar", &sample());
    MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();

    damage_second_header(&archive);
    set_mtime(&archive, modified(&archive) + Duration::from_secs(100));

    let err = MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap_err();
    assert!(err.is_corruption(), "{err}");

    // Without mtime checks the index still matches on size.
    let lenient = IndexOptions {
        verify_mtime: false,
        ..persisted_index()
    };
    let source = MountContext::new(config(lenient))
        .unwrap()
        .open_archive(&archive)
        .unwrap();
    assert!(source.exists("docs/two.txt"));
}

#[test]
fn schema_version_mismatch_forces_a_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), "sample.tar", &sample());
    let ctx = MountContext::new(config(persisted_index())).unwrap();
    ctx.open_archive(&archive).unwrap();

    let db = index_file(&archive);
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute(
            "UPDATE metadata SET value = '0' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
    }

    let source = MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();
    assert_eq!(source.read_file("docs/one.txt", 0, 3).unwrap(), b"one");

    let conn = rusqlite::Connection::open(&db).unwrap();
    let version: String = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(version, seekstone::index::store::SCHEMA_VERSION);
}

#[test]
fn appended_tar_reuses_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let original = tar_files(&[("one", b"1"), ("two", b"22")]);
    let archive = write_archive(dir.path(), "grow.tar", &original);
    MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();

    // Appending overwrites the end-of-archive blocks after the last record.
    let mut grown = original[..2048].to_vec();
    grown.extend(tar_files(&[("three", b"333"), ("one", b"1111")]));
    fs::write(&archive, &grown).unwrap();

    let source = MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();
    assert_eq!(children(&*source, ""), ["one", "three", "two"]);
    assert_eq!(source.read_file("one", 0, 10).unwrap(), b"1111");
    assert_eq!(source.file_versions("one"), 2);
    assert_eq!(source.read_file("two", 0, 10).unwrap(), b"22");

    let conn = rusqlite::Connection::open(index_file(&archive)).unwrap();
    let entries: i64 = conn
        .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
        .unwrap();
    assert_eq!(entries, 4);
}

#[test]
fn appended_sparse_member_is_indexed() {
    let dir = tempfile::tempdir().unwrap();
    let original = tar_files(&[("one", b"1"), ("two", b"22")]);
    let archive = write_archive(dir.path(), "sparse.tar", &original);
    MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();

    let runs = vec![(0, b"start".to_vec()), (40_000, b"end".to_vec())];
    let mut grown = original[..2048].to_vec();
    common::append_old_gnu_sparse(&mut grown, "holes.img", 40_003, &runs);
    grown.extend_from_slice(&[0u8; 1024]);
    fs::write(&archive, &grown).unwrap();

    let source = MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();
    assert_eq!(children(&*source, ""), ["holes.img", "one", "two"]);
    assert_eq!(source.stat("holes.img").unwrap().size, 40_003);
    assert_eq!(
        source.read_file("holes.img", 0, 40_003).unwrap(),
        common::restore_sparse(40_003, &runs)
    );

    // The map survives the round trip through the store.
    let reloaded = MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();
    assert_eq!(reloaded.read_file("holes.img", 39_998, 10).unwrap(), b"\0\0end");
}

#[test]
fn rewritten_tar_past_the_first_record_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let big = vec![b'b'; 100_000];
    let original = tar_files(&[("big", big.as_slice()), ("old", b"old")]);
    let archive = write_archive(dir.path(), "rewrite.tar", &original);
    MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();

    // Same leading record, different second record, and a larger file.
    let rewritten = tar_files(&[("big", big.as_slice()), ("new", b"new"), ("more", b"more")]);
    assert!(rewritten.len() > original.len());
    assert_eq!(rewritten[..100_352], original[..100_352]);
    fs::write(&archive, &rewritten).unwrap();

    let source = MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();
    assert_eq!(children(&*source, ""), ["big", "more", "new"]);
    assert_eq!(source.read_file("new", 0, 10).unwrap(), b"new");
    assert!(!source.exists("old"));
}

#[test]
fn index_folder_is_used_when_beside_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), "sample.tar", &sample());
    fs::create_dir(index_file(&archive)).unwrap();

    let options = IndexOptions {
        index_folders: vec![cache.path().to_path_buf()],
        ..persisted_index()
    };
    let ctx = MountContext::new(config(options.clone())).unwrap();
    ctx.open_archive(&archive).unwrap();
    let fallback = ctx.store().candidates(&archive)[1].clone();
    assert!(fallback.starts_with(cache.path()));
    assert!(fallback.is_file());

    damage_second_header(&archive);
    let source = MountContext::new(config(options))
        .unwrap()
        .open_archive(&archive)
        .unwrap();
    assert!(source.exists("docs/two.txt"));
}

#[test]
fn explicit_index_file() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), "sample.tar", &sample());
    let db = dir.path().join("elsewhere.sqlite");
    let options = IndexOptions {
        location: IndexLocation::File(db.clone()),
        ..persisted_index()
    };
    MountContext::new(config(options))
        .unwrap()
        .open_archive(&archive)
        .unwrap();
    assert!(db.is_file());
    assert!(!index_file(&archive).exists());
}

#[test]
fn clearing_the_cache_discards_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), "sample.tar", &sample());
    MountContext::new(config(persisted_index()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();

    damage_second_header(&archive);
    let clearing = IndexOptions {
        clear_index_cache: true,
        ..persisted_index()
    };
    let err = MountContext::new(config(clearing))
        .unwrap()
        .open_archive(&archive)
        .unwrap_err();
    assert!(err.is_corruption(), "{err}");
    assert!(!index_file(&archive).exists());
}

#[test]
fn small_indexes_are_not_written_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), "sample.tar", &sample());
    MountContext::new(config(IndexOptions::default()))
        .unwrap()
        .open_archive(&archive)
        .unwrap();
    assert!(!index_file(&archive).exists());
}
