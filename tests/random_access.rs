//! Random-access reads against compressed tarballs.
//!
//! Reads served from checkpoints, from pooled decoders and from the
//! block-parallel decoder must all return the bytes a straight decode would.

#![cfg(feature = "gzip")]

mod common;

use std::sync::OnceLock;

use common::{memory_config, open_bytes, tar_files};
use proptest::prelude::*;
use seekstone::{CancellationToken, Error, LeafSource, MountContext, MountSource, Threads};

const FILE: &str = "payload.bin";

fn payload() -> &'static [u8] {
    static PAYLOAD: OnceLock<Vec<u8>> = OnceLock::new();
    PAYLOAD.get_or_init(|| common::noise(1_500_000, 42))
}

fn tarball() -> Vec<u8> {
    let plain = tar_files(&[("head.txt", b"head"), (FILE, payload()), ("tail.txt", b"tail")]);
    common::gzip_members(&plain, 96 * 1024)
}

fn open(threads: Threads) -> LeafSource {
    let config = memory_config()
        .threads(threads)
        .checkpoint_spacing(128 * 1024)
        .parallel_read_threshold(256 * 1024);
    let ctx = MountContext::new(config).unwrap();
    open_bytes(&ctx, tarball(), "big.tar.gz").unwrap()
}

fn shared() -> &'static LeafSource {
    static SOURCE: OnceLock<LeafSource> = OnceLock::new();
    SOURCE.get_or_init(|| open(Threads::count_or_single(2)))
}

/// The same tar gzipped as one member.
fn single_member() -> &'static LeafSource {
    static SOURCE: OnceLock<LeafSource> = OnceLock::new();
    SOURCE.get_or_init(|| {
        let plain = tar_files(&[("head.txt", b"head"), (FILE, payload()), ("tail.txt", b"tail")]);
        let ctx = MountContext::new(memory_config().checkpoint_spacing(128 * 1024)).unwrap();
        open_bytes(&ctx, common::gzip(&plain), "single.tar.gz").unwrap()
    })
}

#[test]
fn single_member_has_inner_checkpoints() {
    let LeafSource::Tar(tar) = single_member() else {
        panic!("expected a tar source");
    };
    let points = tar.reader().checkpoints().to_vec();
    assert!(points.len() >= 8, "{} checkpoints", points.len());
    assert!(points.iter().any(|p| !p.state.is_empty()));
}

#[test]
fn parallel_reads_equal_sequential_reads() {
    let parallel = open(Threads::count_or_single(4));
    let sequential = open(Threads::Single);
    let data = payload();

    for (offset, len) in [(0, data.len()), (333_333, 900_000), (1_000_000, 600_000)] {
        let expected = &data[offset..(offset + len).min(data.len())];
        let fast = parallel.read_file(FILE, offset as u64, len).unwrap();
        let slow = sequential.read_file(FILE, offset as u64, len).unwrap();
        assert_eq!(fast, slow);
        assert_eq!(fast, expected);
    }
}

#[test]
fn pooled_decoders_serve_forward_reads() {
    let source = open(Threads::Single);
    let LeafSource::Tar(tar) = &source else {
        panic!("expected a tar source");
    };
    let data = payload();
    let mut offset = 10_000;
    while offset + 4_096 < data.len() {
        assert_eq!(
            source.read_file(FILE, offset as u64, 4_096).unwrap(),
            &data[offset..offset + 4_096]
        );
        offset += 50_000;
    }
    assert!(tar.reader().pool_stats().hits > 0);
}

#[test]
fn cancelled_reads_stop_early() {
    let source = open(Threads::count_or_single(2));
    let LeafSource::Tar(tar) = &source else {
        panic!("expected a tar source");
    };
    let token = CancellationToken::new();
    token.cancel();
    assert!(matches!(
        tar.read_file_cancellable(FILE, 0, 1_000_000, &token),
        Err(Error::Cancelled)
    ));
    // The source stays usable.
    assert_eq!(source.read_file("tail.txt", 0, 4).unwrap(), b"tail");
}

#[cfg(feature = "bzip2")]
#[test]
fn parallel_bzip2_blocks_match_sequential_reads() {
    let text = common::letters(1_200_000, 5);
    let bytes = common::bzip2_small_blocks(&tar_files(&[("text.txt", text.as_slice())]));
    let open = |threads: Threads| {
        let config = memory_config()
            .threads(threads)
            .checkpoint_spacing(128 * 1024)
            .parallel_read_threshold(256 * 1024);
        let ctx = MountContext::new(config).unwrap();
        open_bytes(&ctx, bytes.clone(), "text.tar.bz2").unwrap()
    };
    let parallel = open(Threads::count_or_single(4));
    let sequential = open(Threads::Single);
    for (offset, len) in [(0, text.len()), (250_000, 700_000), (1_100_000, 500_000)] {
        let expected = &text[offset..(offset + len).min(text.len())];
        let fast = parallel.read_file("text.txt", offset as u64, len).unwrap();
        assert_eq!(fast, expected);
        assert_eq!(sequential.read_file("text.txt", offset as u64, len).unwrap(), fast);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_reads_match_payload(offset in 0usize..1_600_000, len in 0usize..200_000) {
        let data = payload();
        let got = shared().read_file(FILE, offset as u64, len).unwrap();
        let start = offset.min(data.len());
        let end = (offset + len).min(data.len());
        prop_assert_eq!(got.as_slice(), &data[start..end]);
    }

    #[test]
    fn single_member_reads_match_payload(offset in 0usize..1_600_000, len in 0usize..100_000) {
        let data = payload();
        let got = single_member().read_file(FILE, offset as u64, len).unwrap();
        let start = offset.min(data.len());
        let end = (offset + len).min(data.len());
        prop_assert_eq!(got.as_slice(), &data[start..end]);
    }

    #[test]
    fn repeated_reads_are_stable(offset in 0usize..1_500_000) {
        let first = shared().read_file(FILE, offset as u64, 1_024).unwrap();
        let second = shared().read_file(FILE, offset as u64, 1_024).unwrap();
        prop_assert_eq!(first, second);
    }
}
