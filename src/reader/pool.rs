//! Live decoder pooling for sequential access.
//!
//! This module provides [`DecoderPool`] for caching decoders between reads,
//! so that reading a file in consecutive chunks continues where the previous
//! chunk stopped instead of resuming from the nearest checkpoint.
//!
//! # How It Works
//!
//! 1. Look for a cached decoder positioned between the nearest checkpoint
//!    and the target offset
//! 2. If found, skip forward from its position to the target
//! 3. If not found, the reader opens a new decoder at the checkpoint
//! 4. After the read, the decoder is parked again for potential reuse

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::codec::StreamDecoder;

/// Statistics for pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of cache hits (decoder reused)
    pub hits: u64,
    /// Number of cache misses (new decoder created)
    pub misses: u64,
    /// Decoded bytes that did not have to be decoded again thanks to reuse
    pub bytes_saved: u64,
}

impl PoolStats {
    /// Returns the cache hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// An LRU cache of live decoders for one stream.
pub struct DecoderPool {
    cache: LruCache<u64, Box<dyn StreamDecoder>>,
    next_slot: u64,
    stats: PoolStats,
}

impl std::fmt::Debug for DecoderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderPool")
            .field("len", &self.cache.len())
            .field("capacity", &self.cache.cap())
            .field("stats", &self.stats)
            .finish()
    }
}

impl DecoderPool {
    /// Creates a new decoder pool with the specified capacity.
    ///
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_slot: 0,
            stats: PoolStats::default(),
        }
    }

    /// Returns the pool's capacity.
    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Returns the current number of cached decoders.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns true if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Returns the pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Clears all cached decoders.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Takes the decoder closest to `target` whose position lies in `[floor, target]`.
    ///
    /// `floor` is the decoded offset of the checkpoint a fresh decoder would
    /// start at; decoders behind it are no better than starting afresh.
    pub fn take(&mut self, floor: u64, target: u64) -> Option<Box<dyn StreamDecoder>> {
        let best = self
            .cache
            .iter()
            .filter(|(_, decoder)| (floor..=target).contains(&decoder.position()))
            .max_by_key(|(_, decoder)| decoder.position())
            .map(|(slot, _)| *slot);

        match best.and_then(|slot| self.cache.pop(&slot)) {
            Some(decoder) => {
                self.stats.hits += 1;
                self.stats.bytes_saved += decoder.position() - floor;
                Some(decoder)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Returns a decoder to the pool, evicting the least recently used one if full.
    pub fn put(&mut self, decoder: Box<dyn StreamDecoder>) {
        let slot = self.next_slot;
        self.next_slot = self.next_slot.wrapping_add(1);
        self.cache.push(slot, decoder);
    }
}
