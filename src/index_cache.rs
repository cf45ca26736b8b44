//! Bounded, process-wide cache of loaded skip indexes.
//!
//! Keyed by the segment's filename stem path (without extension). Admission
//! and eviction follow an S3-FIFO design: new entries enter a small
//! probationary queue, entries that prove themselves (two or more hits) are
//! promoted to the main queue, and evicted-before-promotion keys are
//! remembered in a ghost queue so a quick return re-enters main directly.
//!
//! Eviction is a capacity concern only. Correctness after compaction relies
//! on the explicit [`SkipIndexCache::flush`] call for removed segments, never
//! on eviction order.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::segment::SkipIndex;

/// Maximum frequency a cached entry accumulates.
const MAX_FREQUENCY_LIMIT: u8 = 3;

struct CacheEntry<V> {
    value: V,
    freq: AtomicU8,
}

/// S3-FIFO keyed cache. Queues hold keys; values live in the entry map, so
/// removal is an O(1) map operation and stale queue slots are discarded
/// lazily during eviction.
struct Cache<K, V>
where
    K: std::hash::Hash + Eq + Clone,
{
    max_main_size: usize,
    max_cache_size: usize,
    /// new keys are admitted to this queue
    small: VecDeque<K>,
    /// keys that have been accessed at least twice are moved to this queue
    main: VecDeque<K>,
    /// keys evicted from small before promotion
    ghost: VecDeque<K>,
    entries: HashMap<K, CacheEntry<V>>,
}

impl<K, V> Cache<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn new(max_cache_size: usize) -> Self {
        let max_small_size = max_cache_size / 10;
        let max_main_size = max_cache_size - max_small_size;
        Self {
            max_main_size,
            max_cache_size,
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        let freq = (entry.freq.load(Ordering::SeqCst) + 1).min(MAX_FREQUENCY_LIMIT);
        entry.freq.store(freq, Ordering::SeqCst);
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: K, value: V) {
        self.evict();

        let was_ghost = self.ghost.iter().any(|k| k == &key);
        let replaced = self
            .entries
            .insert(
                key.clone(),
                CacheEntry {
                    value,
                    freq: AtomicU8::new(0),
                },
            )
            .is_some();

        // A reinserted or returning key skips probation.
        if was_ghost || replaced {
            if !replaced {
                self.main.push_back(key);
            }
        } else {
            self.small.push_back(key);
        }
    }

    fn remove(&mut self, key: &K) {
        self.entries.remove(key);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict(&mut self) {
        while self.entries.len() >= self.max_cache_size {
            if self.main.len() >= self.max_main_size || self.small.is_empty() {
                if !self.evict_main() {
                    break;
                }
            } else {
                self.evict_small();
            }
        }
    }

    fn evict_main(&mut self) -> bool {
        while let Some(key) = self.main.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue; // removed out-of-band, drop the stale slot
            };
            let freq = entry.freq.load(Ordering::SeqCst);
            if freq > 0 {
                entry.freq.store(freq - 1, Ordering::SeqCst);
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn evict_small(&mut self) {
        while let Some(key) = self.small.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.freq.load(Ordering::SeqCst) > 1 {
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.push_ghost(key);
                break;
            }
        }
    }

    fn push_ghost(&mut self, key: K) {
        if self.ghost.len() >= self.max_cache_size {
            self.ghost.pop_front();
        }
        self.ghost.push_back(key);
    }
}

/// Shared skip-index cache.
///
/// `lookup` loads the `.idx` file on miss; `flush` drops the entry for a
/// segment that compaction removed.
pub struct SkipIndexCache {
    cache: Mutex<Cache<PathBuf, Arc<SkipIndex>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl SkipIndexCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(Cache::new(capacity.max(2))),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Fetch the skip index for an `.idx` path, loading it on miss.
    pub fn lookup(&self, path: &Path) -> Result<Arc<SkipIndex>> {
        if let Some(index) = self.cache.lock()?.get(&path.to_path_buf()) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            return Ok(index);
        }

        // Load outside the lock; a racing load of the same path is wasted
        // work, not a correctness problem (the index is immutable).
        self.misses.fetch_add(1, Ordering::SeqCst);
        let index = Arc::new(SkipIndex::load(path)?);
        self.cache.lock()?.insert(path.to_path_buf(), index.clone());
        Ok(index)
    }

    /// Drop the cached index for a removed segment.
    pub fn flush(&self, path: &Path) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&path.to_path_buf());
        }
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` counters.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
        )
    }
}
