//! Memoization of compute-engine primitives keyed by structural signature.
//!
//! Building a primitive is expensive (descriptor validation, kernel selection) while the same
//! shapes recur on every iteration, so callers look up a [`PrimitiveSignature`] first and only
//! construct on a miss. Entries are owned `Arc`s: overwriting, removing, evicting, or clearing
//! drops the cache's reference deterministically.

mod context;
pub mod hashing;
mod policy;
pub mod signature;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use lru::LruCache;
use serde::Serialize;

use crate::profiling::cache_event;

pub use context::CacheContext;
pub use policy::{CacheConfig, EvictionPolicy, DEFAULT_LRU_CAPACITY};
pub use signature::{
    BatchNormSignature, ConvSignature, ExactF64, LinearSignature, LrnSignature, Padding2d,
    PoolingSignature, PrimitiveSignature,
};

/// Point-in-time counters for a single cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub replacements: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    replacements: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Thread-safe store from [`PrimitiveSignature`] to a shared primitive handle.
pub struct PrimitiveCache<P> {
    entries: Mutex<LruCache<PrimitiveSignature, Arc<P>>>,
    policy: EvictionPolicy,
    counters: Counters,
}

impl<P> PrimitiveCache<P> {
    pub fn new(policy: EvictionPolicy) -> Self {
        let entries = match policy {
            EvictionPolicy::Unbounded => LruCache::unbounded(),
            EvictionPolicy::Lru { capacity } => LruCache::new(capacity),
        };
        PrimitiveCache {
            entries: Mutex::new(entries),
            policy,
            counters: Counters::default(),
        }
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self::new(config.eviction)
    }

    // A panic while the lock is held cannot leave the map half-updated: every mutation is a
    // single `LruCache` call.
    fn lock(&self) -> MutexGuard<'_, LruCache<PrimitiveSignature, Arc<P>>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            cache_event("primitive_cache_poisoned");
            poisoned.into_inner()
        })
    }

    /// Exact-match lookup. Never constructs anything.
    pub fn get(&self, signature: &PrimitiveSignature) -> Option<Arc<P>> {
        let found = self.lock().get(signature).cloned();
        self.record_lookup(signature, found.is_some());
        found
    }

    /// Inserts or overwrites the entry for `signature`, returning the handle it replaced.
    pub fn set(&self, signature: PrimitiveSignature, handle: Arc<P>) -> Option<Arc<P>> {
        let mut entries = self.lock();
        self.insert_locked(&mut entries, signature, handle)
    }

    /// Returns the cached primitive or builds, caches, and returns a new one.
    ///
    /// The lock is held across lookup, construction, and insertion, so concurrent callers with
    /// the same signature never build twice. A failed build leaves the cache untouched.
    ///
    /// `build` runs with the cache locked and must not call back into this cache; doing so
    /// deadlocks. Composite primitives should fetch their cached parts before calling this.
    pub fn get_or_try_insert_with<F, E>(
        &self,
        signature: PrimitiveSignature,
        build: F,
    ) -> Result<Arc<P>, E>
    where
        F: FnOnce() -> Result<P, E>,
    {
        let mut entries = self.lock();
        if let Some(found) = entries.get(&signature) {
            let found = Arc::clone(found);
            drop(entries);
            self.record_lookup(&signature, true);
            return Ok(found);
        }
        self.record_lookup(&signature, false);
        let handle = Arc::new(build()?);
        self.insert_locked(&mut entries, signature, Arc::clone(&handle));
        Ok(handle)
    }

    /// Infallible variant of [`PrimitiveCache::get_or_try_insert_with`].
    pub fn get_or_insert_with<F>(&self, signature: PrimitiveSignature, build: F) -> Arc<P>
    where
        F: FnOnce() -> P,
    {
        match self.get_or_try_insert_with(signature, || {
            Ok::<P, std::convert::Infallible>(build())
        }) {
            Ok(handle) => handle,
            Err(never) => match never {},
        }
    }

    /// Checks for an entry without touching recency or counters.
    pub fn contains(&self, signature: &PrimitiveSignature) -> bool {
        self.lock().contains(signature)
    }

    pub fn remove(&self, signature: &PrimitiveSignature) -> Option<Arc<P>> {
        let removed = self.lock().pop(signature);
        if removed.is_some() {
            cache_event("primitive_cache_remove");
            trace!("removed cached primitive {signature}");
        }
        removed
    }

    /// Drops every cached primitive and returns how many were held.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let dropped = entries.len();
        entries.clear();
        drop(entries);
        if dropped > 0 {
            cache_event("primitive_cache_clear");
            debug!("cleared {dropped} cached primitives");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Maximum number of entries, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.policy.capacity()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            replacements: self.counters.replacements.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    fn record_lookup(&self, signature: &PrimitiveSignature, hit: bool) {
        if hit {
            Counters::bump(&self.counters.hits);
            cache_event("primitive_cache_hit");
            trace!("primitive cache hit for {signature}");
        } else {
            Counters::bump(&self.counters.misses);
            cache_event("primitive_cache_miss");
            debug!(
                "primitive cache miss for {signature} ({:016x})",
                signature.fingerprint()
            );
        }
    }

    fn insert_locked(
        &self,
        entries: &mut LruCache<PrimitiveSignature, Arc<P>>,
        signature: PrimitiveSignature,
        handle: Arc<P>,
    ) -> Option<Arc<P>> {
        Counters::bump(&self.counters.insertions);
        cache_event("primitive_cache_insert");
        match entries.push(signature, handle) {
            Some((previous_key, previous)) if previous_key == signature => {
                Counters::bump(&self.counters.replacements);
                cache_event("primitive_cache_replace");
                debug!("replaced cached primitive {signature}");
                Some(previous)
            }
            Some((evicted_key, _evicted)) => {
                Counters::bump(&self.counters.evictions);
                cache_event("primitive_cache_evict");
                debug!("evicted cached primitive {evicted_key} to make room for {signature}");
                None
            }
            None => None,
        }
    }
}

impl<P> Default for PrimitiveCache<P> {
    fn default() -> Self {
        Self::new(EvictionPolicy::default())
    }
}

impl<P> fmt::Debug for PrimitiveCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimitiveCache")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relu(size: usize) -> PrimitiveSignature {
        PrimitiveSignature::Relu { size }
    }

    #[test]
    fn set_then_get_returns_same_handle() {
        let cache = PrimitiveCache::<String>::default();
        let handle = Arc::new("relu-10".to_string());
        assert!(cache.set(relu(10), Arc::clone(&handle)).is_none());
        let found = cache.get(&relu(10)).unwrap();
        assert!(Arc::ptr_eq(&found, &handle));
        assert!(cache.get(&relu(11)).is_none());
    }

    #[test]
    fn overwrite_returns_previous_handle() {
        let cache = PrimitiveCache::<u32>::default();
        cache.set(relu(4), Arc::new(1));
        let previous = cache.set(relu(4), Arc::new(2)).unwrap();
        assert_eq!(*previous, 1);
        assert_eq!(*cache.get(&relu(4)).unwrap(), 2);
        assert_eq!(cache.stats().replacements, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn overwrite_drops_unreferenced_previous_handle() {
        let cache = PrimitiveCache::<u32>::default();
        let first = Arc::new(1);
        let weak = Arc::downgrade(&first);
        cache.set(relu(4), first);
        drop(cache.set(relu(4), Arc::new(2)));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn failed_build_leaves_cache_empty() {
        let cache = PrimitiveCache::<u32>::default();
        let result: Result<_, &str> = cache.get_or_try_insert_with(relu(3), || Err("boom"));
        assert_eq!(result.unwrap_err(), "boom");
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn lru_policy_evicts_least_recently_used() {
        let cache = PrimitiveCache::<u32>::new(EvictionPolicy::lru(2).unwrap());
        cache.set(relu(1), Arc::new(1));
        cache.set(relu(2), Arc::new(2));
        assert!(cache.get(&relu(1)).is_some());
        cache.set(relu(3), Arc::new(3));
        assert!(cache.contains(&relu(1)));
        assert!(!cache.contains(&relu(2)));
        assert!(cache.contains(&relu(3)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn clear_and_remove_release_entries() {
        let cache = PrimitiveCache::<u32>::default();
        cache.set(relu(1), Arc::new(1));
        cache.set(relu(2), Arc::new(2));
        assert_eq!(*cache.remove(&relu(1)).unwrap(), 1);
        assert!(cache.remove(&relu(1)).is_none());
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }
}
