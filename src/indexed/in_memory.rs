//! In-Memory Decoration
//!
//! A bounded LRU in front of the async cache. Entries are values or known
//! misses (`None`), so a confirmed absence does not cost a worker round trip.
//!
//! # Invalidation
//!
//! The map is only valid while nobody else writes the backing files. On
//! every lock acquisition the new lock state is compared with the state
//! recorded at the previous release:
//!
//! ```text
//!   before_lock_release(s1) ── record s1
//!             ... another process may lock, write, release ...
//!   after_lock_acquire(s2)  ── s2.has_been_updated_since(s1)? ─► clear map
//! ```
//!
//! The first acquisition has nothing to compare with and always clears.

use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::sizer::HeapProportionalCacheSizer;
use super::synchronizing::CrossProcessSynchronizingIndexedCache;
use super::{
    AsyncCacheAccessDecoratedCache, AsyncCacheAccessWorker, AsyncIndexedCache, CacheKey,
    CacheValue, MultiProcessSafeIndexedCache, UnitOfWorkParticipant,
};
use crate::access::{CacheAccess, Releaser};
use crate::config::CacheSettings;
use crate::error::{Error, Result};
use crate::guard::ProducerGuard;
use crate::lock::LockState;

/// Requested in-memory decoration of a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InMemoryDecoratorConfig {
    /// Reference size, scaled to the memory budget
    pub max_entries_to_keep_in_memory: usize,
    /// Keep the in-memory layer even in short-lived processes
    pub cache_in_memory_for_short_lived_processes: bool,
}

impl InMemoryDecoratorConfig {
    pub fn new(max_entries_to_keep_in_memory: usize) -> Self {
        Self {
            max_entries_to_keep_in_memory,
            cache_in_memory_for_short_lived_processes: false,
        }
    }

    pub fn for_short_lived_processes(mut self) -> Self {
        self.cache_in_memory_for_short_lived_processes = true;
        self
    }
}

type Entries<K, V> = Arc<Mutex<LruCache<K, Option<V>>>>;

/// In-memory map of one cache file, shared by every decoration of it
struct CacheDetails<K, V> {
    max_entries: usize,
    entries: Entries<K, V>,
    last_state: Arc<Mutex<Option<LockState>>>,
    evictions: Arc<AtomicU64>,
    producers: Arc<ProducerGuard<K>>,
}

// =============================================================================
// Decorated cache
// =============================================================================

/// Read-through in-memory layer over an [`AsyncIndexedCache`]
pub struct InMemoryDecoratedCache<K, V> {
    cache_id: String,
    delegate: Arc<dyn AsyncIndexedCache<K, V>>,
    entries: Entries<K, V>,
    last_state: Arc<Mutex<Option<LockState>>>,
    evictions: Arc<AtomicU64>,
    producers: Arc<ProducerGuard<K>>,
}

impl<K: CacheKey, V: CacheValue> InMemoryDecoratedCache<K, V> {
    /// Stand-alone decoration with its own map of `max_entries`
    pub fn new(cache_id: &str, delegate: Arc<dyn AsyncIndexedCache<K, V>>, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache_id: cache_id.to_string(),
            delegate,
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            last_state: Arc::new(Mutex::new(None)),
            evictions: Arc::new(AtomicU64::new(0)),
            producers: Arc::new(ProducerGuard::adaptive()),
        }
    }

    fn with_details(cache_id: &str, delegate: Arc<dyn AsyncIndexedCache<K, V>>, details: &CacheDetails<K, V>) -> Self {
        Self {
            cache_id: cache_id.to_string(),
            delegate,
            entries: details.entries.clone(),
            last_state: details.last_state.clone(),
            evictions: details.evictions.clone(),
            producers: details.producers.clone(),
        }
    }

    /// Number of values and known misses held in memory
    pub fn in_memory_len(&self) -> usize {
        self.entries.lock().len()
    }

    fn remember(&self, key: K, value: Option<V>) {
        let mut entries = self.entries.lock();
        let capacity = entries.cap().get();
        let evicted = entries.push(key.clone(), value);
        drop(entries);
        if matches!(evicted, Some((old_key, _)) if old_key != key) {
            let count = self.evictions.fetch_add(1, Ordering::Relaxed) + 1;
            if count % capacity as u64 == 1 || capacity == 1 {
                warn!(
                    "In-memory cache {} is full ({} entries), evicting least recently used entries ({} evictions so far)",
                    self.cache_id, capacity, count
                );
            }
        }
    }

    fn cached(&self, key: &K) -> Option<Option<V>> {
        self.entries.lock().get(key).cloned()
    }
}

impl<K: CacheKey, V: CacheValue> UnitOfWorkParticipant for InMemoryDecoratedCache<K, V> {
    fn after_lock_acquire(&self, state: &LockState) {
        let last = *self.last_state.lock();
        if state.has_been_updated_since(last.as_ref()) {
            let mut entries = self.entries.lock();
            if !entries.is_empty() {
                info!(
                    "Invalidating in-memory cache of {}: the backing file may have changed",
                    self.cache_id
                );
            }
            entries.clear();
        }
        self.delegate.after_lock_acquire(state);
    }

    fn finish_work(&self) {
        self.delegate.finish_work();
    }

    fn before_lock_release(&self, state: &LockState) {
        *self.last_state.lock() = Some(*state);
        self.delegate.before_lock_release(state);
    }
}

impl<K: CacheKey, V: CacheValue> AsyncIndexedCache<K, V> for InMemoryDecoratedCache<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        if let Some(cached) = self.cached(key) {
            return Ok(cached);
        }
        let value = self.delegate.get(key)?;
        self.remember(key.clone(), value.clone());
        Ok(value)
    }

    fn get_or_create(
        &self,
        key: &K,
        producer: &dyn Fn(&K) -> Result<V>,
        completion: Releaser,
    ) -> Result<V> {
        let known_missing = match self.cached(key) {
            Some(Some(value)) => {
                completion.release();
                return Ok(value);
            }
            Some(None) => true,
            None => false,
        };
        if !known_missing {
            if let Some(value) = self.delegate.get(key)? {
                self.remember(key.clone(), Some(value.clone()));
                completion.release();
                return Ok(value);
            }
        }
        // Threads missing on the same key wait for the first producer. The
        // guard covers the producer only, never a worker round trip.
        let (value, produced) = self.producers.guard_by_key(key, || -> Result<(V, bool)> {
            if let Some(Some(value)) = self.cached(key) {
                return Ok((value, false));
            }
            let value = producer(key)?;
            self.remember(key.clone(), Some(value.clone()));
            Ok((value, true))
        })?;
        if produced {
            self.delegate.put_later(key.clone(), value.clone(), completion)?;
        } else {
            completion.release();
        }
        Ok(value)
    }

    fn put_later(&self, key: K, value: V, completion: Releaser) -> Result<()> {
        self.remember(key.clone(), Some(value.clone()));
        self.delegate.put_later(key, value, completion)
    }

    fn remove_later(&self, key: K, completion: Releaser) -> Result<()> {
        self.remember(key.clone(), None);
        self.delegate.remove_later(key, completion)
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Builds decorated caches and keeps their in-memory maps alive across
/// coordinators of the same process, keyed by cache file
pub struct InMemoryCacheDecoratorFactory {
    long_living_process: bool,
    sizer: HeapProportionalCacheSizer,
    caches: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for InMemoryCacheDecoratorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCacheDecoratorFactory")
            .field("long_living_process", &self.long_living_process)
            .field("caches", &self.caches.len())
            .finish()
    }
}

impl InMemoryCacheDecoratorFactory {
    pub fn new(long_living_process: bool, sizer: HeapProportionalCacheSizer) -> Self {
        Self {
            long_living_process,
            sizer,
            caches: DashMap::new(),
        }
    }

    pub fn from_settings(long_living_process: bool, settings: &CacheSettings) -> Self {
        Self::new(long_living_process, HeapProportionalCacheSizer::from_settings(settings))
    }

    /// Build the decoration chain on top of `persistent`
    pub fn decorate<K: CacheKey, V: CacheValue>(
        &self,
        cache_id: &str,
        cache_name: &str,
        persistent: Arc<dyn MultiProcessSafeIndexedCache<K, V>>,
        access: Arc<CacheAccess>,
        worker: Arc<AsyncCacheAccessWorker>,
        config: &InMemoryDecoratorConfig,
    ) -> Result<Arc<CrossProcessSynchronizingIndexedCache<K, V>>> {
        let async_cache: Arc<dyn AsyncIndexedCache<K, V>> =
            Arc::new(AsyncCacheAccessDecoratedCache::new(worker, persistent));
        let target: Arc<dyn AsyncIndexedCache<K, V>> = if !self.long_living_process && !config.cache_in_memory_for_short_lived_processes {
            debug!(
                "Creating in-memory cache decorator for {} is skipped in a short-lived process",
                cache_name
            );
            async_cache
        } else {
            let max_entries = self.sizer.scale_cache_size(config.max_entries_to_keep_in_memory);
            let details = self.details::<K, V>(cache_id, max_entries)?;
            Arc::new(InMemoryDecoratedCache::with_details(cache_id, async_cache, &details))
        };
        Ok(Arc::new(CrossProcessSynchronizingIndexedCache::new(target, access)))
    }

    fn details<K: CacheKey, V: CacheValue>(
        &self,
        cache_id: &str,
        max_entries: usize,
    ) -> Result<Arc<CacheDetails<K, V>>> {
        let erased = self
            .caches
            .entry(cache_id.to_string())
            .or_insert_with(|| {
                debug!("Creating in-memory store for cache {} (max size: {})", cache_id, max_entries);
                let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
                let details: Arc<dyn Any + Send + Sync> = Arc::new(CacheDetails::<K, V> {
                    max_entries,
                    entries: Arc::new(Mutex::new(LruCache::new(capacity))),
                    last_state: Arc::new(Mutex::new(None)),
                    evictions: Arc::new(AtomicU64::new(0)),
                    producers: Arc::new(ProducerGuard::adaptive()),
                });
                details
            })
            .clone();
        let details = erased.downcast::<CacheDetails<K, V>>().map_err(|_| {
            Error::Config(format!(
                "in-memory cache {} was created for different key or value types",
                cache_id
            ))
        })?;
        if details.max_entries != max_entries {
            return Err(Error::Config(format!(
                "Mismatched in-memory cache size for cache {}, expected: {}, found: {}",
                cache_id, details.max_entries, max_entries
            )));
        }
        Ok(details)
    }
}

// =============================================================================
// Tests
// =============================================================================
