//! Fuzz target for opening arbitrary bytes as an archive.
//!
//! Exercises format detection, the tar header parser and the zip directory
//! parser with adversarial input, then reads every indexed file.
//!
//! Run with: cargo +nightly fuzz run index_build

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use seekstone::{
    IndexOptions, MemorySource, MountConfig, MountContext, MountSource, SourceInfo, Threads,
    Timestamp,
};

fuzz_target!(|data: &[u8]| {
    let config = MountConfig::new()
        .threads(Threads::Single)
        .best_effort(true)
        .index(IndexOptions::in_memory());
    let Ok(ctx) = MountContext::new(config) else {
        return;
    };

    for name in ["fuzz.tar", "fuzz.zip", "fuzz.gz"] {
        let info = SourceInfo {
            name: name.to_string(),
            identity: None,
            mtime: Timestamp::EPOCH,
            ownership: Default::default(),
        };
        let Ok(source) = ctx.open_source(Arc::new(MemorySource::new(data.to_vec())), info) else {
            continue;
        };
        walk(&source, "");
    }
});

fn walk(source: &dyn MountSource, dir: &str) {
    let Ok(children) = source.list_children(dir) else {
        return;
    };
    for name in children {
        let path = if dir.is_empty() {
            name
        } else {
            format!("{dir}/{name}")
        };
        let Ok(entry) = source.stat(&path) else {
            continue;
        };
        if entry.is_dir() {
            walk(source, &path);
        } else if entry.is_file() || entry.is_hardlink() {
            let _ = source.read_file(&path, 0, entry.size.min(1 << 20) as usize);
            let _ = source.read_file(&path, entry.size / 2, 64);
        } else {
            let _ = source.read_link(&path);
        }
    }
}
