//! The path index of one archive.
//!
//! An [`Index`] maps normalized paths to every version of that path in scan
//! order. The last version is the current one. Every ancestor of an indexed
//! path exists as a directory; ancestors the archive never recorded are
//! synthesized, so the tree is always connected to the root.
//!
//! # Example
//!
//! ```rust
//! use seekstone::{Entry, EntryKind, Index, Timestamp};
//!
//! let mut file = Entry::synthetic_dir("a/f1", Timestamp::EPOCH, 1);
//! file.kind = EntryKind::File;
//! file.synthetic = false;
//!
//! let mut index = Index::new();
//! index.insert(file);
//!
//! assert!(index.current("a").unwrap().synthetic);
//! assert_eq!(index.list_children("a").unwrap().into_iter().collect::<Vec<_>>(), ["f1"]);
//! ```

mod entry;
mod sparse;
pub mod store;

pub use entry::{EntryKind, Entry, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, SYNTHETIC_DIR_MODE};
pub use sparse::{SparseMap, SparsePiece, SparseSegment};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::archive_path;

/// Hard link chains longer than this are treated as broken.
const MAX_LINK_DEPTH: usize = 32;

/// Paths to entry versions, plus the directory structure.
#[derive(Debug, Clone)]
pub struct Index {
    versions: HashMap<String, Vec<Arc<Entry>>>,
    children: HashMap<String, BTreeSet<String>>,
    next_occurrence: u64,
    recorded: usize,
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl Index {
    /// An index holding only the root directory.
    pub fn new() -> Self {
        let mut versions = HashMap::new();
        versions.insert(String::new(), vec![Arc::new(Entry::root())]);
        Self {
            versions,
            children: HashMap::new(),
            next_occurrence: 0,
            recorded: 0,
        }
    }

    /// Adds a version of `entry.path`.
    ///
    /// Missing ancestors, and ancestors whose current version is not a
    /// directory, get a synthetic directory version first.
    pub fn insert(&mut self, entry: Entry) -> Arc<Entry> {
        let path = entry.path.clone();
        for ancestor in archive_path::ancestors(&path) {
            let is_dir = self
                .latest(ancestor)
                .is_some_and(|current| current.is_dir());
            if !is_dir {
                let dir = Entry::synthetic_dir(ancestor, entry.mtime, entry.occurrence);
                self.push(Arc::new(dir));
            }
        }

        if !entry.synthetic {
            self.recorded += 1;
            self.next_occurrence = self.next_occurrence.max(entry.occurrence + 1);
        }
        let entry = Arc::new(entry);
        self.push(Arc::clone(&entry));
        entry
    }

    fn push(&mut self, entry: Arc<Entry>) {
        if let Some((parent, name)) = archive_path::split_parent(&entry.path) {
            self.children
                .entry(parent.to_string())
                .or_default()
                .insert(name.to_string());
        }
        self.versions
            .entry(entry.path.clone())
            .or_default()
            .push(entry);
    }

    fn latest(&self, path: &str) -> Option<&Arc<Entry>> {
        self.versions.get(path).and_then(|versions| versions.last())
    }

    /// The current version of `path`, if it is visible.
    ///
    /// A path is hidden when its latest version is a whiteout, when an
    /// ancestor is not currently a directory, or when an ancestor was
    /// whited out after this version was recorded.
    pub fn current(&self, path: &str) -> Option<Arc<Entry>> {
        let entry = self.latest(path)?;
        if entry.is_deleted() {
            return None;
        }
        for ancestor in archive_path::ancestors(path) {
            let versions = self.versions.get(ancestor)?;
            if !versions.last().is_some_and(|dir| dir.is_dir()) {
                return None;
            }
            let removed_later = versions
                .iter()
                .any(|v| v.is_deleted() && v.occurrence > entry.occurrence);
            if removed_later {
                return None;
            }
        }
        Some(Arc::clone(entry))
    }

    /// Every recorded version of `path`, oldest first, synthetic ones included.
    pub fn versions(&self, path: &str) -> &[Arc<Entry>] {
        self.versions.get(path).map_or(&[], Vec::as_slice)
    }

    /// Visible children of a visible directory.
    ///
    /// Returns `None` if `path` is not currently a directory.
    pub fn list_children(&self, path: &str) -> Option<BTreeSet<String>> {
        let dir = self.current(path)?;
        if !dir.is_dir() {
            return None;
        }
        let Some(names) = self.children.get(path) else {
            return Some(BTreeSet::new());
        };
        Some(
            names
                .iter()
                .filter(|name| self.current(&archive_path::join(path, name)).is_some())
                .cloned()
                .collect(),
        )
    }

    /// Follows a hard link to the entry that holds its content.
    ///
    /// The target is the latest version of the link's target path recorded
    /// before the link itself. Chains are followed; a missing or cyclic
    /// target yields `None`. Non-links resolve to themselves.
    pub fn resolve_hardlink(&self, entry: &Arc<Entry>) -> Option<Arc<Entry>> {
        let mut current = Arc::clone(entry);
        for _ in 0..MAX_LINK_DEPTH {
            let EntryKind::HardLink { target } = &current.kind else {
                return Some(current);
            };
            let next = self
                .versions(target)
                .iter()
                .rev()
                .find(|v| v.occurrence < current.occurrence && !v.synthetic && !v.is_deleted())?;
            current = Arc::clone(next);
        }
        None
    }

    /// Number of entries recorded from the archive (synthetic ones excluded).
    pub fn len(&self) -> usize {
        self.recorded
    }

    /// Returns true if nothing was recorded from the archive.
    pub fn is_empty(&self) -> bool {
        self.recorded == 0
    }

    /// Occurrence number for the next recorded entry.
    pub fn next_occurrence(&self) -> u64 {
        self.next_occurrence
    }

    /// Recorded entries in scan order.
    pub fn recorded_entries(&self) -> Vec<Arc<Entry>> {
        let mut entries: Vec<Arc<Entry>> = self
            .versions
            .values()
            .flatten()
            .filter(|entry| !entry.synthetic)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.occurrence);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;

    fn entry(path: &str, kind: EntryKind, occurrence: u64) -> Entry {
        let mode = match kind {
            EntryKind::Directory => S_IFDIR | 0o755,
            EntryKind::Symlink { .. } => S_IFLNK | 0o777,
            _ => S_IFREG | 0o644,
        };
        Entry {
            path: path.to_string(),
            kind,
            size: 10,
            mode,
            ownership: Default::default(),
            mtime: Timestamp::from_unix_secs(1_700_000_000),
            content_offset: occurrence * 1024,
            header_offset: occurrence * 1024 - 512,
            source_id: 0,
            occurrence,
            synthetic: false,
            sparse: None,
        }
    }

    fn file(path: &str, occurrence: u64) -> Entry {
        entry(path, EntryKind::File, occurrence)
    }

    fn names(set: Option<BTreeSet<String>>) -> Vec<String> {
        set.unwrap().into_iter().collect()
    }

    #[test]
    fn test_root_is_always_a_directory() {
        let index = Index::new();
        assert!(index.current("").unwrap().is_dir());
        assert!(index.list_children("").unwrap().is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_synthesizes_missing_ancestors() {
        let mut index = Index::new();
        index.insert(file("a/b/c.txt", 1));

        let a = index.current("a").unwrap();
        assert!(a.is_dir() && a.synthetic);
        assert_eq!(a.mode, SYNTHETIC_DIR_MODE);
        assert_eq!(a.mtime, Timestamp::from_unix_secs(1_700_000_000));
        assert_eq!(names(index.list_children("")), ["a"]);
        assert_eq!(names(index.list_children("a/b")), ["c.txt"]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_directory_with_two_files() {
        let mut index = Index::new();
        index.insert(entry("a", EntryKind::Directory, 0));
        index.insert(file("a/f1", 1));
        index.insert(file("a/f2", 2));

        assert_eq!(names(index.list_children("")), ["a"]);
        assert_eq!(names(index.list_children("a")), ["f1", "f2"]);
        assert!(index.list_children("a/f1").is_none());
        assert!(!index.current("a").unwrap().synthetic);
    }

    #[test]
    fn test_later_duplicate_is_current() {
        let mut index = Index::new();
        index.insert(file("x", 0));
        let mut second = file("x", 1);
        second.size = 99;
        index.insert(second);

        assert_eq!(index.current("x").unwrap().size, 99);
        let versions = index.versions("x");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].size, 10);
        assert_eq!(names(index.list_children("")), ["x"]);
    }

    #[test]
    fn test_file_replaced_by_directory() {
        let mut index = Index::new();
        index.insert(file("a", 0));
        index.insert(file("a/b", 1));

        assert!(index.current("a").unwrap().is_dir());
        assert_eq!(index.versions("a").len(), 2);
        assert!(index.current("a/b").is_some());
    }

    #[test]
    fn test_whiteout_hides_path_and_subtree() {
        let mut index = Index::new();
        index.insert(file("d/old", 0));
        index.insert(file("keep", 1));
        index.insert(entry("d", EntryKind::Deleted, 2));

        assert!(index.current("d").is_none());
        assert!(index.current("d/old").is_none());
        assert_eq!(names(index.list_children("")), ["keep"]);
        assert_eq!(index.versions("d").len(), 2);

        // Recreating the directory does not resurrect the old content.
        index.insert(file("d/new", 3));
        assert!(index.current("d/new").is_some());
        assert!(index.current("d/old").is_none());
        assert_eq!(names(index.list_children("d")), ["new"]);
    }

    #[test]
    fn test_resolve_hardlink_uses_earlier_version() {
        let mut index = Index::new();
        index.insert(file("target", 0));
        let link = index.insert(entry(
            "link",
            EntryKind::HardLink {
                target: "target".into(),
            },
            1,
        ));
        let mut newer = file("target", 2);
        newer.size = 500;
        index.insert(newer);

        let resolved = index.resolve_hardlink(&link).unwrap();
        assert_eq!(resolved.occurrence, 0);
        assert_eq!(resolved.size, 10);
    }

    #[test]
    fn test_resolve_hardlink_chain_and_missing() {
        let mut index = Index::new();
        index.insert(file("a", 0));
        index.insert(entry("b", EntryKind::HardLink { target: "a".into() }, 1));
        let c = index.insert(entry("c", EntryKind::HardLink { target: "b".into() }, 2));
        let dangling = index.insert(entry(
            "d",
            EntryKind::HardLink {
                target: "nowhere".into(),
            },
            3,
        ));

        assert_eq!(index.resolve_hardlink(&c).unwrap().path, "a");
        assert!(index.resolve_hardlink(&dangling).is_none());
    }

    #[test]
    fn test_recorded_entries_in_scan_order() {
        let mut index = Index::new();
        index.insert(file("z/1", 0));
        index.insert(file("a/2", 1));
        index.insert(file("m", 2));

        let order: Vec<u64> = index
            .recorded_entries()
            .iter()
            .map(|e| e.occurrence)
            .collect();
        assert_eq!(order, [0, 1, 2]);
        assert_eq!(index.next_occurrence(), 3);
    }
}
