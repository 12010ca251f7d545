//! Indexed Caches
//!
//! Named key/value caches handed out by a coordinator. An undecorated cache
//! is the persistent layer alone and must be used inside `use_cache`. A
//! decorated cache stacks an in-memory map and write batching on top and may
//! be used from any thread:
//!
//! ```text
//!   IndexedCache (handle)
//!        │
//!        ▼
//!   CrossProcessSynchronizingIndexedCache   holds the file lock per call,
//!        │                                  until queued writes complete
//!        ▼
//!   InMemoryDecoratedCache                  LRU of values / known misses,
//!        │                                  dropped when another process wrote
//!        ▼
//!   AsyncCacheAccessDecoratedCache          reads via worker.read,
//!        │                                  writes via worker.enqueue
//!        ▼
//!   PersistentIndexedCache                  IndexedStore through FileAccess
//! ```
//!
//! Every layer is a [`UnitOfWorkParticipant`] so the coordinator can tell
//! the whole chain when the file lock is acquired or about to be released.

mod async_decorated;
mod in_memory;
mod persistent;
mod sizer;
mod synchronizing;
mod worker;

pub use async_decorated::AsyncCacheAccessDecoratedCache;
pub use in_memory::{InMemoryCacheDecoratorFactory, InMemoryDecoratedCache, InMemoryDecoratorConfig};
pub use persistent::PersistentIndexedCache;
pub use sizer::{HeapProportionalCacheSizer, DEFAULT_GRANULARITY};
pub use synchronizing::CrossProcessSynchronizingIndexedCache;
pub use worker::{AsyncCacheAccessWorker, ExclusiveAccess};

use std::hash::Hash;
use std::sync::Arc;

use crate::access::Releaser;
use crate::error::Result;
use crate::lock::LockState;

/// Bounds every cache key satisfies
pub trait CacheKey: Clone + Eq + Hash + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + 'static> CacheKey for T {}

/// Bounds every cache value satisfies
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> CacheValue for T {}

/// Lifecycle hooks of a unit of work holding the file lock.
///
/// Implementations must not call back into the coordinator.
pub trait UnitOfWorkParticipant: Send + Sync {
    /// The file lock was just acquired in `state`
    fn after_lock_acquire(&self, _state: &LockState) {}

    /// The unit of work ends; flush and close anything open on the files
    fn finish_work(&self) {}

    /// The file lock is about to be released in `state`
    fn before_lock_release(&self, _state: &LockState) {}
}

/// A cache whose operations are safe with respect to other processes
pub trait MultiProcessSafeIndexedCache<K, V>: UnitOfWorkParticipant {
    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Return the cached value or produce, store and return it
    fn get_or_create(&self, key: &K, producer: &dyn Fn(&K) -> Result<V>) -> Result<V>;

    fn put(&self, key: K, value: V) -> Result<()>;

    fn remove(&self, key: &K) -> Result<()>;
}

/// A cache whose writes complete later, on the access worker.
///
/// `completion` runs exactly once, when the write has been applied or has
/// failed.
pub trait AsyncIndexedCache<K, V>: UnitOfWorkParticipant {
    fn get(&self, key: &K) -> Result<Option<V>>;

    fn get_or_create(
        &self,
        key: &K,
        producer: &dyn Fn(&K) -> Result<V>,
        completion: Releaser,
    ) -> Result<V>;

    fn put_later(&self, key: K, value: V, completion: Releaser) -> Result<()>;

    fn remove_later(&self, key: K, completion: Releaser) -> Result<()>;
}

/// Handle to a cache registered with a coordinator
pub struct IndexedCache<K, V> {
    name: Arc<str>,
    inner: Arc<dyn MultiProcessSafeIndexedCache<K, V>>,
}

impl<K, V> Clone for IndexedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for IndexedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedCache").field("name", &self.name).finish()
    }
}

impl<K, V> IndexedCache<K, V> {
    pub(crate) fn new(name: &str, inner: Arc<dyn MultiProcessSafeIndexedCache<K, V>>) -> Self {
        Self {
            name: Arc::from(name),
            inner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether both handles refer to the same registered cache
    pub fn same_as(&self, other: &IndexedCache<K, V>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.inner.get(key)
    }

    pub fn get_or_create(&self, key: &K, producer: impl Fn(&K) -> Result<V>) -> Result<V> {
        self.inner.get_or_create(key, &producer)
    }

    pub fn put(&self, key: K, value: V) -> Result<()> {
        self.inner.put(key, value)
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.inner.remove(key)
    }
}
