//! Deduplication of concurrent builds.
//!
//! Opening an archive means scanning it once. When several callers ask for
//! the same archive at the same time, only the first one scans; the others
//! block until it finishes and share its result (or its error).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::{Error, Result};

type Slot<T> = Arc<OnceLock<std::result::Result<Arc<T>, Arc<Error>>>>;

/// At most one in-flight computation per key.
pub(crate) struct SingleFlight<K, T> {
    slots: Mutex<HashMap<K, Slot<T>>>,
    retain: bool,
}

impl<K, T> std::fmt::Debug for SingleFlight<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.slots.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("SingleFlight")
            .field("keys", &len)
            .field("retain", &self.retain)
            .finish()
    }
}

impl<K: Eq + Hash + Clone, T> SingleFlight<K, T> {
    /// Forgets each result once its computation has completed.
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            retain: false,
        }
    }

    /// Keeps every successful result for the lifetime of this value.
    ///
    /// A failed run is still shared with the callers waiting on it, then
    /// forgotten, so the next caller builds again.
    pub(crate) fn memoizing() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            retain: true,
        }
    }

    /// Runs `build` for `key` unless a run for the same key is already in
    /// flight (or memoized), in which case its result is shared.
    pub(crate) fn run(&self, key: K, build: impl FnOnce() -> Result<T>) -> Result<Arc<T>> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let outcome = slot
            .get_or_init(|| build().map(Arc::new).map_err(Arc::new))
            .clone();

        if !self.retain || outcome.is_err() {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.remove(&key);
            }
        }

        outcome.map_err(|e| e.share())
    }

    /// Number of keys currently tracked.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
