//! Shared test utilities for integration tests.
//!
//! Fixtures are built in-process with the `tar` crate and the codec crates,
//! so every test starts from known bytes.
//!
//! Note: `#![allow(dead_code)]` is required because each integration test file
//! compiles as a separate crate and may only use a subset of these helpers.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use seekstone::{
    ByteSource, IndexOptions, LeafSource, MemorySource, MountConfig, MountContext, Ownership,
    SourceInfo, Threads, Timestamp,
};

/// Modification time given to every fixture entry.
pub const MTIME: u64 = 1_700_000_000;

/// One entry of a fixture tar.
#[derive(Debug, Clone)]
pub enum Item<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Symlink(&'a str, &'a str),
    HardLink(&'a str, &'a str),
}

/// Builds an uncompressed GNU tar holding `items` in order.
pub fn tar_bytes(items: &[Item<'_>]) -> Vec<u8> {
    let mut tar = tar::Builder::new(Vec::new());
    for item in items {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(MTIME);
        header.set_uid(1000);
        header.set_gid(1000);
        match item {
            Item::Dir(path) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                tar.append_data(&mut header, path, std::io::empty()).unwrap();
            }
            Item::File(path, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                tar.append_data(&mut header, path, *data).unwrap();
            }
            Item::Symlink(path, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                tar.append_link(&mut header, path, target).unwrap();
            }
            Item::HardLink(path, target) => {
                header.set_entry_type(tar::EntryType::Link);
                header.set_mode(0o644);
                header.set_size(0);
                tar.append_link(&mut header, path, target).unwrap();
            }
        }
    }
    tar.into_inner().unwrap()
}

/// A tar of `(path, data)` files.
pub fn tar_files(files: &[(&str, &[u8])]) -> Vec<u8> {
    let items: Vec<Item<'_>> = files.iter().map(|(p, d)| Item::File(p, d)).collect();
    tar_bytes(&items)
}

/// Deterministic, poorly compressible bytes.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.r#gen::<u8>()).collect()
}

/// Deterministic, compressible bytes over a sixteen-letter alphabet.
pub fn letters(len: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| b'a' + rng.gen_range(0..16u8)).collect()
}

/// Gzips `data` as one member.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Gzips `data` as independent members of `member_size` input bytes each.
pub fn gzip_members(data: &[u8], member_size: usize) -> Vec<u8> {
    data.chunks(member_size.max(1))
        .flat_map(|chunk| gzip(chunk))
        .collect()
}

/// Bzip2-compresses `data`.
pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Bzip2-compresses `data` as one stream of 100 kB blocks.
pub fn bzip2_small_blocks(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// XZ-compresses `data` as one stream cut into blocks of `block_size`.
#[cfg(feature = "xz")]
pub fn xz_blocks(data: &[u8], block_size: u64) -> Vec<u8> {
    let mut options = lzma_rust2::XzOptions::with_preset(0);
    options.set_block_size(std::num::NonZeroU64::new(block_size));
    let mut writer = lzma_rust2::XzWriter::new(Vec::new(), options).unwrap();
    writer.write_all(data).unwrap();
    writer.finish().unwrap()
}

/// Zstd-compresses `data` as one frame.
pub fn zstd(data: &[u8]) -> Vec<u8> {
    zstd::encode_all(data, 3).unwrap()
}

/// A stored run of a sparse file: its offset in the restored file and its
/// bytes.
pub type SparseRun = (u64, Vec<u8>);

/// The file a sparse member restores to.
pub fn restore_sparse(real_size: u64, runs: &[SparseRun]) -> Vec<u8> {
    let mut out = vec![0u8; real_size as usize];
    for (offset, data) in runs {
        out[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
    }
    out
}

fn pad_block(out: &mut Vec<u8>) {
    out.resize(out.len().div_ceil(512) * 512, 0);
}

fn octal_field(field: &mut [u8], value: u64) {
    let text = format!("{value:0width$o}", width = field.len() - 1);
    field[..text.len()].copy_from_slice(text.as_bytes());
}

fn pax_record(key: &str, value: &str) -> String {
    let body = format!(" {key}={value}\n");
    let mut len = body.len() + 1;
    while format!("{len}{body}").len() != len {
        len += 1;
    }
    format!("{len}{body}")
}

/// Appends a ustar regular file to a hand-built tar.
pub fn append_file(out: &mut Vec<u8>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_ustar();
    header.set_path(path).unwrap();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(MTIME);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    pad_block(out);
}

/// Appends an old GNU sparse member (`S` typeflag) whose map fits the
/// header's four slots.
pub fn append_old_gnu_sparse(out: &mut Vec<u8>, path: &str, real_size: u64, runs: &[SparseRun]) {
    assert!(runs.len() <= 4);
    let data: Vec<u8> = runs.iter().flat_map(|(_, d)| d.iter().copied()).collect();
    let mut header = tar::Header::new_gnu();
    header.set_path(path).unwrap();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(MTIME);
    header.set_entry_type(tar::EntryType::GNUSparse);
    let bytes = header.as_mut_bytes();
    for (i, (offset, run)) in runs.iter().enumerate() {
        octal_field(&mut bytes[386 + i * 24..398 + i * 24], *offset);
        octal_field(&mut bytes[398 + i * 24..410 + i * 24], run.len() as u64);
    }
    octal_field(&mut bytes[483..495], real_size);
    header.set_cksum();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&data);
    pad_block(out);
}

/// Appends a PAX sparse member in map format 1.0: the map leads the data
/// and the header carries a `GNUSparseFile.0` placeholder name.
pub fn append_pax_sparse(out: &mut Vec<u8>, path: &str, real_size: u64, runs: &[SparseRun]) {
    let records = [
        pax_record("GNU.sparse.major", "1"),
        pax_record("GNU.sparse.minor", "0"),
        pax_record("GNU.sparse.name", path),
        pax_record("GNU.sparse.realsize", &real_size.to_string()),
    ]
    .concat();
    let mut pax = tar::Header::new_ustar();
    pax.set_path("PaxHeaders/sparse").unwrap();
    pax.set_size(records.len() as u64);
    pax.set_mode(0o644);
    pax.set_entry_type(tar::EntryType::XHeader);
    pax.set_cksum();
    out.extend_from_slice(pax.as_bytes());
    out.extend_from_slice(records.as_bytes());
    pad_block(out);

    let mut data = format!("{}\n", runs.len()).into_bytes();
    for (offset, run) in runs {
        data.extend_from_slice(format!("{offset}\n{}\n", run.len()).as_bytes());
    }
    pad_block(&mut data);
    for (_, run) in runs {
        data.extend_from_slice(run);
    }
    let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
    let placeholder = if dir.is_empty() {
        format!("GNUSparseFile.0/{name}")
    } else {
        format!("{dir}/GNUSparseFile.0/{name}")
    };
    append_file(out, &placeholder, &data);
}

/// A configuration that touches no index files and spawns no threads.
pub fn memory_config() -> MountConfig {
    MountConfig::new()
        .threads(Threads::Single)
        .index(IndexOptions::in_memory())
}

/// Index options that persist every index, however small.
pub fn persisted_index() -> IndexOptions {
    IndexOptions {
        min_entry_count: 0,
        ..IndexOptions::default()
    }
}

/// Opens `bytes` as an archive named `name` without touching the disk.
pub fn open_bytes(ctx: &MountContext, bytes: Vec<u8>, name: &str) -> seekstone::Result<LeafSource> {
    let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(bytes));
    let info = SourceInfo {
        name: name.to_string(),
        identity: None,
        mtime: Timestamp::from_unix_secs(MTIME as i64),
        ownership: Ownership::default(),
    };
    ctx.open_source(source, info)
}

/// Writes `bytes` to `name` inside `dir` and returns the canonical path.
pub fn write_archive(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    std::fs::canonicalize(path).unwrap()
}

/// Sorted names of the children of `path`.
pub fn children(source: &dyn seekstone::MountSource, path: &str) -> Vec<String> {
    source.list_children(path).unwrap().into_iter().collect()
}

/// Builds a zip archive of stored (uncompressed) files.
pub fn stored_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    for (name, data) in files {
        let crc = crc32fast::hash(data);
        let offset = out.len() as u32;
        let size = data.len() as u32;

        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        for field in [20u16, 0x0800, 0, 0, 0x21] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for field in [crc, size, size] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        for field in [(3u16 << 8) | 20, 20, 0x0800, 0, 0, 0x21] {
            central.extend_from_slice(&field.to_le_bytes());
        }
        for field in [crc, size, size] {
            central.extend_from_slice(&field.to_le_bytes());
        }
        for field in [name.len() as u16, 0, 0, 0, 0] {
            central.extend_from_slice(&field.to_le_bytes());
        }
        central.extend_from_slice(&(0o100644u32 << 16).to_le_bytes());
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name.as_bytes());
    }

    let directory_offset = out.len() as u32;
    out.extend_from_slice(&central);
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    for field in [0u16, 0, files.len() as u16, files.len() as u16] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&directory_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}
