//! Configuration for mounting archives.
//!
//! This module provides [`MountConfig`] for controlling checkpoint density,
//! parallelism, recursion, union precedence and the persisted index store.
//!
//! # Example
//!
//! ```rust
//! use seekstone::{MountConfig, Precedence, Threads};
//!
//! let config = MountConfig::new()
//!     .checkpoint_spacing(1024 * 1024)
//!     .threads(Threads::count_or_single(4))
//!     .recursive(true)
//!     .union_precedence(Precedence::LaterWins);
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;

use crate::{Error, Result};

/// Default distance, in decoded bytes, between two checkpoints.
pub const DEFAULT_CHECKPOINT_SPACING: u64 = 4 * 1024 * 1024;

/// Default number of entries below which a built index is not persisted.
pub const DEFAULT_MIN_ENTRY_COUNT: usize = 1000;

/// Thread count configuration for block-parallel decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threads {
    /// One worker per available CPU.
    #[default]
    Auto,
    /// Use a specific number of threads.
    Count(std::num::NonZeroUsize),
    /// Single-threaded operation. Reads and scans never use the pool.
    Single,
}

impl Threads {
    /// Creates a `Threads::Count` variant from a `usize`.
    ///
    /// Returns `Threads::Single` if the count is zero.
    ///
    /// ```rust
    /// use seekstone::Threads;
    ///
    /// assert_eq!(Threads::count_or_single(0), Threads::Single);
    /// assert_eq!(Threads::count_or_single(4).count(), 4);
    /// ```
    pub fn count_or_single(n: usize) -> Self {
        match std::num::NonZeroUsize::new(n) {
            Some(count) => Self::Count(count),
            None => Self::Single,
        }
    }

    /// Returns the actual thread count.
    ///
    /// - `Threads::Auto`: Returns the number of available CPUs, minimum 1
    /// - `Threads::Count(n)`: Returns `n.get()`
    /// - `Threads::Single`: Returns 1
    pub fn count(&self) -> usize {
        match self {
            Self::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            Self::Count(n) => n.get(),
            Self::Single => 1,
        }
    }
}

/// Which member of a union wins when two define the same path.
///
/// There is no default: a union of more than one source must choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    /// Sources registered later shadow earlier ones.
    LaterWins,
    /// Sources registered earlier shadow later ones.
    EarlierWins,
}

/// Where the persisted index of an archive is looked for and written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IndexLocation {
    /// `<archive>.index.sqlite` next to the archive, then each of
    /// [`IndexOptions::index_folders`].
    #[default]
    Beside,
    /// An explicit index file.
    File(PathBuf),
    /// Keep the index in memory only; nothing is loaded or written.
    Memory,
}

/// Options for the persisted index store.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Where to look for and write index files.
    pub location: IndexLocation,
    /// Fallback folders for index files when the archive's folder is not writable.
    pub index_folders: Vec<PathBuf>,
    /// Persist freshly built indexes. Default: true.
    pub write_index: bool,
    /// Delete existing index files before mounting. Default: false.
    pub clear_index_cache: bool,
    /// Treat a modification time change as staleness. Default: true.
    ///
    /// Size changes always invalidate an index.
    pub verify_mtime: bool,
    /// Also record and verify a CRC-32 over the archive's first and last 64 KiB.
    /// Default: false.
    pub content_fingerprint: bool,
    /// Indexes with fewer entries than this are cheap to rebuild and are
    /// not written. Default: 1000.
    pub min_entry_count: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            location: IndexLocation::Beside,
            index_folders: Vec::new(),
            write_index: true,
            clear_index_cache: false,
            verify_mtime: true,
            content_fingerprint: false,
            min_entry_count: DEFAULT_MIN_ENTRY_COUNT,
        }
    }
}

impl IndexOptions {
    /// Options that never touch the filesystem.
    pub fn in_memory() -> Self {
        Self {
            location: IndexLocation::Memory,
            write_index: false,
            ..Self::default()
        }
    }
}

/// A regex rewrite applied to every archive path before it is normalized.
///
/// Requires the `regex` feature to take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTransform {
    /// Regular expression matched against the raw recorded path.
    pub pattern: String,
    /// Replacement, with `$1`-style group references.
    pub replacement: String,
}

impl PathTransform {
    /// Creates a transform from a pattern and its replacement.
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }
}

/// Configuration for mounting archives.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Minimum decoded distance between two checkpoints.
    ///
    /// Compressed streams can only be resumed at member or frame boundaries,
    /// so a checkpoint is placed at the first such boundary past this distance.
    /// Default: 4 MiB.
    pub checkpoint_spacing: u64,

    /// Worker threads for block-parallel decoding and decode-ahead scanning.
    pub threads: Threads,

    /// Reads of at least this many bytes use the block-parallel decoder when
    /// the codec allows it. Default: 1 MiB.
    pub parallel_read_threshold: usize,

    /// Live decoders kept per reader for sequential access.
    ///
    /// `0` sizes the pool to the CPU count. Default: 0.
    pub decoder_pool_capacity: usize,

    /// Decoded chunks buffered ahead of the index parser. Default: 4.
    pub prefetch_depth: usize,

    /// Expose archives found inside mounted trees as directories. Default: false.
    pub recursive: bool,

    /// Maximum nesting depth for recursive mounting. `None` is unlimited.
    pub max_recursion_depth: Option<usize>,

    /// Recognize nested archives by content when their extension says nothing.
    /// Default: false.
    pub detect_by_content: bool,

    /// Shadowing direction for unions of several roots.
    pub union_precedence: Option<Precedence>,

    /// Persisted index options.
    pub index: IndexOptions,

    /// Mount the entries parsed before a corruption or truncation instead of
    /// failing. Default: false.
    pub best_effort: bool,

    /// Path rewrite applied while indexing tar archives.
    pub transform: Option<PathTransform>,

    /// Interpret OCI whiteout files (`.wh.<name>`) as deletions. Default: false.
    pub oci_whiteouts: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            checkpoint_spacing: DEFAULT_CHECKPOINT_SPACING,
            threads: Threads::Auto,
            parallel_read_threshold: 1024 * 1024,
            decoder_pool_capacity: 0,
            prefetch_depth: 4,
            recursive: false,
            max_recursion_depth: None,
            detect_by_content: false,
            union_precedence: None,
            index: IndexOptions::default(),
            best_effort: false,
            transform: None,
            oci_whiteouts: false,
        }
    }
}

impl MountConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for memory-constrained environments.
    ///
    /// Sparse checkpoints, a single thread and a minimal decoder pool.
    pub fn low_memory() -> Self {
        Self {
            checkpoint_spacing: 16 * 1024 * 1024,
            threads: Threads::Single,
            decoder_pool_capacity: 1,
            prefetch_depth: 1,
            ..Self::default()
        }
    }

    /// Creates a configuration for fast random access.
    ///
    /// Dense checkpoints and a larger decoder pool.
    pub fn high_performance() -> Self {
        Self {
            checkpoint_spacing: 1024 * 1024,
            parallel_read_threshold: 256 * 1024,
            decoder_pool_capacity: 16,
            prefetch_depth: 16,
            ..Self::default()
        }
    }

    /// Sets the checkpoint spacing.
    pub fn checkpoint_spacing(mut self, bytes: u64) -> Self {
        self.checkpoint_spacing = bytes;
        self
    }

    /// Sets the worker thread count.
    pub fn threads(mut self, threads: Threads) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the block-parallel read threshold.
    pub fn parallel_read_threshold(mut self, bytes: usize) -> Self {
        self.parallel_read_threshold = bytes;
        self
    }

    /// Sets the decoder pool capacity.
    pub fn decoder_pool_capacity(mut self, capacity: usize) -> Self {
        self.decoder_pool_capacity = capacity;
        self
    }

    /// Enables or disables recursive mounting.
    pub fn recursive(mut self, enabled: bool) -> Self {
        self.recursive = enabled;
        self
    }

    /// Limits recursion depth.
    pub fn max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = Some(depth);
        self
    }

    /// Enables content sniffing for nested archives.
    pub fn detect_by_content(mut self, enabled: bool) -> Self {
        self.detect_by_content = enabled;
        self
    }

    /// Sets the union precedence.
    pub fn union_precedence(mut self, precedence: Precedence) -> Self {
        self.union_precedence = Some(precedence);
        self
    }

    /// Sets the persisted index options.
    pub fn index(mut self, index: IndexOptions) -> Self {
        self.index = index;
        self
    }

    /// Enables best-effort mounting of partially readable archives.
    pub fn best_effort(mut self, enabled: bool) -> Self {
        self.best_effort = enabled;
        self
    }

    /// Sets the path transform.
    pub fn transform(mut self, transform: PathTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Enables OCI whiteout handling.
    pub fn oci_whiteouts(mut self, enabled: bool) -> Self {
        self.oci_whiteouts = enabled;
        self
    }

    /// Returns the effective decoder pool capacity.
    pub fn effective_pool_capacity(&self) -> usize {
        if self.decoder_pool_capacity == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.decoder_pool_capacity
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_spacing == 0 {
            return Err(Error::InvalidConfig(
                "checkpoint_spacing must be greater than 0".into(),
            ));
        }

        if self.prefetch_depth == 0 {
            return Err(Error::InvalidConfig(
                "prefetch_depth must be greater than 0".into(),
            ));
        }

        if self.max_recursion_depth == Some(0) && self.recursive {
            return Err(Error::InvalidConfig(
                "max_recursion_depth of 0 disables recursion; set recursive(false) instead".into(),
            ));
        }

        if let IndexLocation::File(path) = &self.index.location {
            if path.as_os_str().is_empty() {
                return Err(Error::InvalidConfig("index file path is empty".into()));
            }
        }

        if let Some(transform) = &self.transform {
            if transform.pattern.is_empty() {
                return Err(Error::InvalidConfig("transform pattern is empty".into()));
            }
            #[cfg(feature = "regex")]
            regex::Regex::new(&transform.pattern)
                .map_err(|e| Error::InvalidConfig(format!("invalid transform pattern: {e}")))?;
            #[cfg(not(feature = "regex"))]
            return Err(Error::InvalidConfig(
                "path transforms require the `regex` feature".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MountConfig::default();
        assert_eq!(config.checkpoint_spacing, DEFAULT_CHECKPOINT_SPACING);
        assert_eq!(config.threads, Threads::Auto);
        assert!(!config.recursive);
        assert!(config.union_precedence.is_none());
        assert!(config.index.write_index);
        assert!(config.index.verify_mtime);
        assert_eq!(config.index.min_entry_count, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(MountConfig::low_memory().validate().is_ok());
        assert!(MountConfig::high_performance().validate().is_ok());
        assert_eq!(MountConfig::low_memory().threads.count(), 1);
    }

    #[test]
    fn test_builder() {
        let config = MountConfig::new()
            .checkpoint_spacing(512)
            .recursive(true)
            .max_recursion_depth(3)
            .union_precedence(Precedence::EarlierWins)
            .best_effort(true);
        assert_eq!(config.checkpoint_spacing, 512);
        assert_eq!(config.max_recursion_depth, Some(3));
        assert_eq!(config.union_precedence, Some(Precedence::EarlierWins));
        assert!(config.best_effort);
    }

    #[test]
    fn test_validate_rejects_zero_spacing() {
        let config = MountConfig::new().checkpoint_spacing(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_depth_with_recursion() {
        let config = MountConfig::new().recursive(true).max_recursion_depth(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_transform() {
        let config = MountConfig::new().transform(PathTransform::new("", "x"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threads() {
        assert_eq!(Threads::Single.count(), 1);
        assert!(Threads::Auto.count() >= 1);
        assert_eq!(Threads::count_or_single(3).count(), 3);
    }

    #[test]
    fn test_effective_pool_capacity() {
        assert_eq!(
            MountConfig::new().decoder_pool_capacity(5).effective_pool_capacity(),
            5
        );
        assert!(MountConfig::new().effective_pool_capacity() >= 1);
    }

    #[test]
    fn test_in_memory_index_options() {
        let options = IndexOptions::in_memory();
        assert_eq!(options.location, IndexLocation::Memory);
        assert!(!options.write_index);
    }
}
