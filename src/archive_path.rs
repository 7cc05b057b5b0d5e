//! Normalized paths inside a mounted tree.
//!
//! Archives record paths in many shapes: `./a/b`, `/a//b/`, `a/./b/../c`.
//! Everything that enters an [`Index`](crate::index::Index) or is passed to a
//! [`MountSource`](crate::MountSource) goes through [`normalize`] first, so
//! lookups only ever compare one canonical spelling.
//!
//! The root of a tree is the empty path `""`. Callers may also spell it `/`.

use crate::{Error, Result};
use std::fmt;

/// Maximum length for archive paths (in bytes).
///
/// Longer names are rejected instead of being indexed.
const MAX_PATH_LENGTH: usize = 32768;

/// Normalizes a path to the canonical form used by indexes.
///
/// Separators are `/`; leading `/` and `./`, empty segments and `.` are
/// dropped; `..` removes the previous segment and is clamped at the root.
///
/// # Examples
///
/// ```
/// use seekstone::archive_path::normalize;
///
/// assert_eq!(normalize("./a//b/"), "a/b");
/// assert_eq!(normalize("/a/./b/../c"), "a/c");
/// assert_eq!(normalize("../../etc"), "etc");
/// assert_eq!(normalize("/"), "");
/// ```
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Splits a normalized path into its parent and its final segment.
///
/// The root has no parent.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(idx) => Some((&path[..idx], &path[idx + 1..])),
        None => Some(("", path)),
    }
}

/// Joins a normalized directory path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Returns every proper ancestor of a normalized path, nearest to the root first.
///
/// The root itself is not included.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(idx, _)| &path[..idx])
}

/// A validated, normalized path inside an archive.
///
/// # Examples
///
/// ```
/// use seekstone::ArchivePath;
///
/// let path = ArchivePath::new("./dir//file.txt").unwrap();
/// assert_eq!(path.as_str(), "dir/file.txt");
/// assert_eq!(path.file_name(), "file.txt");
/// assert_eq!(path.parent().unwrap().as_str(), "dir");
///
/// assert!(ArchivePath::new("bad\0name").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ArchivePath(String);

impl ArchivePath {
    /// Creates a new `ArchivePath`, normalizing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the path contains NUL bytes or exceeds the
    /// maximum path length.
    pub fn new(s: &str) -> Result<Self> {
        if s.contains('\0') {
            return Err(Error::InvalidArchivePath("contains NUL byte".into()));
        }
        if s.len() > MAX_PATH_LENGTH {
            return Err(Error::InvalidArchivePath(format!(
                "path exceeds maximum length of {} bytes",
                MAX_PATH_LENGTH
            )));
        }
        Ok(Self(normalize(s)))
    }

    /// Returns the root path.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Returns true for the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the path as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Joins this path with another relative path.
    pub fn join(&self, other: &str) -> Result<Self> {
        Self::new(&join(&self.0, other))
    }

    /// Returns the parent directory of this path, if any.
    ///
    /// The parent of a single-segment path is the root.
    pub fn parent(&self) -> Option<Self> {
        split_parent(&self.0).map(|(parent, _)| Self(parent.to_string()))
    }

    /// Returns the file name (last segment) of this path.
    pub fn file_name(&self) -> &str {
        split_parent(&self.0).map_or("", |(_, name)| name)
    }

    /// Returns the file extension, if any.
    ///
    /// Returns `None` if the file name starts with its only dot
    /// (e.g., `.gitignore` has no extension).
    pub fn extension(&self) -> Option<&str> {
        let file_name = self.file_name();
        let dot_pos = file_name.rfind('.')?;
        if dot_pos == 0 {
            None
        } else {
            Some(&file_name[dot_pos + 1..])
        }
    }

    /// Returns an iterator over the path components (segments).
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Returns true if this path starts with the given prefix.
    ///
    /// This performs a component-wise comparison, not a string prefix match.
    pub fn starts_with(&self, prefix: &str) -> bool {
        let prefix = normalize(prefix);
        if prefix.is_empty() {
            return true;
        }
        self.0 == prefix
            || (self.0.starts_with(&prefix) && self.0.as_bytes().get(prefix.len()) == Some(&b'/'))
    }

    /// Returns the remainder of this path below `prefix`, if it is below it.
    pub fn strip_prefix(&self, prefix: &str) -> Option<&str> {
        if !self.starts_with(prefix) {
            return None;
        }
        let prefix_len = normalize(prefix).len();
        let rest = &self.0[prefix_len..];
        Some(rest.strip_prefix('/').unwrap_or(rest))
    }
}

impl AsRef<str> for ArchivePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl TryFrom<&str> for ArchivePath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_plain() {
        assert_eq!(normalize("a/b/c.txt"), "a/b/c.txt");
        assert_eq!(normalize("file"), "file");
    }

    #[test]
    fn test_normalize_leading_markers() {
        assert_eq!(normalize("./a"), "a");
        assert_eq!(normalize("/a"), "a");
        assert_eq!(normalize("///a"), "a");
        assert_eq!(normalize("././a"), "a");
    }

    #[test]
    fn test_normalize_trailing_slash() {
        assert_eq!(normalize("a/"), "a");
        assert_eq!(normalize("a/b//"), "a/b");
    }

    #[test]
    fn test_normalize_dot_dot() {
        assert_eq!(normalize("a/b/../c"), "a/c");
        assert_eq!(normalize("a/../../b"), "b");
        assert_eq!(normalize(".."), "");
    }

    #[test]
    fn test_normalize_root_spellings() {
        for root in ["", "/", ".", "./", "//", "/./"] {
            assert_eq!(normalize(root), "", "{root:?}");
        }
    }

    #[test]
    fn test_normalize_backslashes() {
        assert_eq!(normalize("dir\\file.txt"), "dir/file.txt");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("a/b/c"), Some(("a/b", "c")));
        assert_eq!(split_parent("a"), Some(("", "a")));
        assert_eq!(split_parent(""), None);
    }

    #[test]
    fn test_ancestors() {
        let got: Vec<_> = ancestors("a/b/c").collect();
        assert_eq!(got, vec!["a", "a/b"]);
        assert_eq!(ancestors("a").count(), 0);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a/b", "c"), "a/b/c");
    }

    #[test]
    fn test_archive_path_rejects_nul() {
        let err = ArchivePath::new("file\0.txt").unwrap_err();
        assert!(matches!(err, Error::InvalidArchivePath(_)));
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    fn test_archive_path_rejects_overlong() {
        let long = "a".repeat(MAX_PATH_LENGTH + 1);
        assert!(ArchivePath::new(&long).is_err());
    }

    #[test]
    fn test_archive_path_parent_and_name() {
        let path = ArchivePath::new("dir/sub/file.tar.gz").unwrap();
        assert_eq!(path.file_name(), "file.tar.gz");
        assert_eq!(path.extension(), Some("gz"));
        assert_eq!(path.parent().unwrap().as_str(), "dir/sub");

        let top = ArchivePath::new("top").unwrap();
        assert!(top.parent().unwrap().is_root());
        assert!(ArchivePath::root().parent().is_none());
    }

    #[test]
    fn test_archive_path_extension_dotfile() {
        assert_eq!(ArchivePath::new(".gitignore").unwrap().extension(), None);
        assert_eq!(ArchivePath::new("dir/file").unwrap().extension(), None);
    }

    #[test]
    fn test_archive_path_starts_with() {
        let path = ArchivePath::new("dir/subdir/file.txt").unwrap();
        assert!(path.starts_with("dir"));
        assert!(path.starts_with("/dir/subdir/"));
        assert!(!path.starts_with("di"));
        assert!(path.starts_with(""));
    }

    #[test]
    fn test_archive_path_strip_prefix() {
        let path = ArchivePath::new("outer.tar/inner.tar.gz/x").unwrap();
        assert_eq!(path.strip_prefix("outer.tar"), Some("inner.tar.gz/x"));
        assert_eq!(path.strip_prefix("outer.tar/inner.tar.gz/x"), Some(""));
        assert_eq!(path.strip_prefix("other"), None);
    }

    #[test]
    fn test_archive_path_display() {
        assert_eq!(ArchivePath::new("a/b").unwrap().to_string(), "/a/b");
        assert_eq!(ArchivePath::root().to_string(), "/");
    }

    #[test]
    fn test_components() {
        let path = ArchivePath::new("a/b/c.txt").unwrap();
        let components: Vec<_> = path.components().collect();
        assert_eq!(components, vec!["a", "b", "c.txt"]);
        assert_eq!(ArchivePath::root().components().count(), 0);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(path in "[a-z./]{0,24}") {
            let once = normalize(&path);
            prop_assert_eq!(normalize(&once), once.clone());
            prop_assert!(!once.starts_with('/'));
            prop_assert!(!once.ends_with('/'));
            prop_assert!(!once.split('/').any(|s| s == ".." || s == "."));
        }
    }
}
