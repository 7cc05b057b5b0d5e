//! Several sources overlaid on each other.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::MountSource;
use crate::archive_path;
use crate::config::Precedence;
use crate::index::Entry;
use crate::{Error, Result};

/// Overlays sources in precedence order.
///
/// A path resolves to the first source (by precedence) that has it. A
/// directory lists the children of every source in which the path is a
/// directory, as long as the winning entry is itself a directory; a file in
/// a higher-precedence source hides directories of the same name below it.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use seekstone::{MountConfig, MountContext, MountSource, Precedence, UnionSource};
///
/// let ctx = MountContext::new(MountConfig::default())?;
/// let base: Arc<dyn MountSource> = ctx.open_archive("base.tar")?;
/// let patch: Arc<dyn MountSource> = ctx.open_archive("patch.tar")?;
/// let merged = UnionSource::new(vec![base, patch], Precedence::LaterWins);
/// println!("{:?}", merged.list_children("")?);
/// # Ok::<(), seekstone::Error>(())
/// ```
#[derive(Debug)]
pub struct UnionSource {
    /// Highest precedence first.
    sources: Vec<Arc<dyn MountSource>>,
}

impl UnionSource {
    /// Overlays `sources`, given in registration order.
    pub fn new(mut sources: Vec<Arc<dyn MountSource>>, precedence: Precedence) -> Self {
        if precedence == Precedence::LaterWins {
            sources.reverse();
        }
        Self { sources }
    }

    /// Number of member sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if there are no member sources.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// The source that decides `path`, and its entry.
    fn winner(&self, path: &str) -> Result<(&Arc<dyn MountSource>, Entry)> {
        let mut miss = None;
        for source in &self.sources {
            match source.stat(path) {
                Ok(entry) => return Ok((source, entry)),
                Err(e) if e.is_lookup_miss() => {
                    miss.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(miss.unwrap_or_else(|| Error::not_found(path)))
    }
}

impl MountSource for UnionSource {
    fn list_children(&self, path: &str) -> Result<BTreeSet<String>> {
        let path = archive_path::normalize(path);
        let (_, entry) = self.winner(&path)?;
        if !entry.is_dir() {
            return Err(Error::NotADirectory { path });
        }
        let mut names = BTreeSet::new();
        for source in &self.sources {
            match source.list_children(&path) {
                Ok(children) => names.extend(children),
                Err(e) if e.is_lookup_miss() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(names)
    }

    fn stat(&self, path: &str) -> Result<Entry> {
        self.winner(&archive_path::normalize(path))
            .map(|(_, entry)| entry)
    }

    fn read_file(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let path = archive_path::normalize(path);
        let (source, _) = self.winner(&path)?;
        source.read_file(&path, offset, len)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let path = archive_path::normalize(path);
        let (source, _) = self.winner(&path)?;
        source.read_link(&path)
    }

    fn versions(&self, path: &str) -> Result<Vec<Entry>> {
        let path = archive_path::normalize(path);
        let (source, _) = self.winner(&path)?;
        source.versions(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{EntryKind, Index, S_IFDIR, S_IFREG};
    use crate::mount::{index_content, index_list, index_read_link, index_stat};
    use crate::timestamp::Timestamp;

    /// A source whose file contents are the name of the source.
    #[derive(Debug)]
    struct Fixed {
        name: &'static str,
        index: Index,
    }

    impl Fixed {
        fn new(name: &'static str, paths: &[(&str, bool)]) -> Arc<dyn MountSource> {
            let mut index = Index::new();
            for (i, (path, is_dir)) in paths.iter().enumerate() {
                index.insert(Entry {
                    path: path.to_string(),
                    kind: if *is_dir {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                    size: name.len() as u64,
                    mode: if *is_dir { S_IFDIR | 0o755 } else { S_IFREG | 0o644 },
                    ownership: Default::default(),
                    mtime: Timestamp::EPOCH,
                    content_offset: 0,
                    header_offset: 0,
                    source_id: 0,
                    occurrence: i as u64,
                    synthetic: false,
                    sparse: None,
                });
            }
            Arc::new(Self { name, index })
        }
    }

    impl MountSource for Fixed {
        fn list_children(&self, path: &str) -> Result<BTreeSet<String>> {
            index_list(&self.index, path)
        }

        fn stat(&self, path: &str) -> Result<Entry> {
            index_stat(&self.index, path)
        }

        fn read_file(&self, path: &str, _offset: u64, _len: usize) -> Result<Vec<u8>> {
            index_content(&self.index, path)?;
            Ok(self.name.as_bytes().to_vec())
        }

        fn read_link(&self, path: &str) -> Result<String> {
            index_read_link(&self.index, path)
        }
    }

    fn pair(precedence: Precedence) -> UnionSource {
        let first = Fixed::new("first", &[("x", false), ("d/one", false), ("shadow", true)]);
        let second = Fixed::new(
            "second",
            &[("x", false), ("d/two", false), ("shadow", false), ("only2", false)],
        );
        UnionSource::new(vec![first, second], precedence)
    }

    #[test]
    fn test_later_wins() {
        let union = pair(Precedence::LaterWins);
        assert_eq!(union.read_file("x", 0, 100).unwrap(), b"second");
        assert_eq!(union.read_file("only2", 0, 100).unwrap(), b"second");
        assert!(union.stat("shadow").unwrap().is_file());
        assert!(matches!(
            union.list_children("shadow"),
            Err(Error::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_earlier_wins() {
        let union = pair(Precedence::EarlierWins);
        assert_eq!(union.read_file("x", 0, 100).unwrap(), b"first");
        assert!(union.stat("shadow").unwrap().is_dir());
        assert!(matches!(
            union.read_file("shadow", 0, 1),
            Err(Error::NotAFile { .. })
        ));
    }

    #[test]
    fn test_directories_merge() {
        let union = pair(Precedence::LaterWins);
        let d: Vec<_> = union.list_children("d").unwrap().into_iter().collect();
        assert_eq!(d, ["one", "two"]);
        let root: Vec<_> = union.list_children("").unwrap().into_iter().collect();
        assert_eq!(root, ["d", "only2", "shadow", "x"]);
        assert!(matches!(union.stat("missing"), Err(Error::NotFound { .. })));
        assert!(!union.exists("d/three"));
    }
}
