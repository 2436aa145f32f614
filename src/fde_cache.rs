use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::cfi::FdeSet;
use crate::error::ObjectError;

/// The number of binaries whose frame description entries are kept by default.
pub const DEFAULT_FDE_CACHE_CAPACITY: usize = 128;

/// Counters describing how effective the cache has been.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub corrupted: u64,
}

/// Decoded frame description entries, keyed by build id and shared between
/// every process which maps the same binary.
///
/// Entries are handed out as `Arc`s, so evicting an entry never affects a
/// reader that already holds it. The lock is only held for the lookup or the
/// insertion itself, never while decoding.
pub struct FdeCache {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: LruCache<String, Arc<FdeSet>>,
    stats: CacheStats,
}

impl FdeCache {
    /// Creates a cache holding at most `capacity` binaries. A capacity of 0 is
    /// treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Looks up the entries for `build_id`. A miss is not an error.
    ///
    /// An entry that was labeled with a different build id than its key is
    /// dropped and reported as a miss.
    pub fn get(&self, build_id: &str) -> Option<Arc<FdeSet>> {
        let mut inner = self.inner.lock();
        let cached = inner.entries.get(build_id).cloned();
        match cached {
            Some(fdes) if fdes.build_id().is_some_and(|id| id != build_id) => {
                inner.entries.pop(build_id);
                inner.stats.corrupted += 1;
                inner.stats.misses += 1;
                drop(inner);
                log::warn!(
                    "{}, decoding again",
                    ObjectError::CacheCorruption(build_id.to_string())
                );
                None
            }
            Some(fdes) => {
                inner.stats.hits += 1;
                Some(fdes)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Stores the entries for `build_id`, evicting the least recently used
    /// binary if the cache is full. Replaces any existing entry.
    pub fn put(&self, build_id: &str, fdes: Arc<FdeSet>) {
        let evicted = {
            let mut inner = self.inner.lock();
            inner.stats.inserts += 1;
            match inner.entries.push(build_id.to_string(), fdes) {
                Some((key, _)) if key != build_id => {
                    inner.stats.evictions += 1;
                    Some(key)
                }
                _ => None,
            }
        };
        if let Some(key) = evicted {
            log::trace!("Evicted frame description entries for build id {key}");
        }
    }

    pub fn contains(&self, build_id: &str) -> bool {
        self.inner.lock().entries.contains(build_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

impl Default for FdeCache {
    fn default() -> Self {
        Self::new(DEFAULT_FDE_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for FdeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FdeCache")
            .field("len", &inner.entries.len())
            .field("capacity", &inner.entries.cap())
            .field("stats", &inner.stats)
            .finish()
    }
}
