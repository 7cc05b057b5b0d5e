//! Fuzz target for path normalization with arbitrary string input.
//!
//! Run with: cargo +nightly fuzz run archive_path
//!
//! Properties checked:
//! - Normalized paths never escape the root
//! - Normalization is idempotent
//! - Every ancestor is a prefix of the path

#![no_main]

use libfuzzer_sys::fuzz_target;
use seekstone::archive_path;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    let normalized = archive_path::normalize(raw);
    assert!(
        !normalized.split('/').any(|segment| segment == ".." || segment == "."),
        "Traversal segment in normalized path: {:?}",
        normalized
    );
    assert!(
        !normalized.starts_with('/') && !normalized.ends_with('/'),
        "Unanchored separator in normalized path: {:?}",
        normalized
    );
    assert_eq!(archive_path::normalize(&normalized), normalized);

    for ancestor in archive_path::ancestors(&normalized) {
        assert!(normalized.starts_with(ancestor));
    }

    if let Ok(path) = seekstone::ArchivePath::new(raw) {
        assert_eq!(path.as_str(), normalized);
    }
});
