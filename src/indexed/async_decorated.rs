//! Routes cache operations through the access worker

use std::sync::Arc;

use super::{
    AsyncCacheAccessWorker, AsyncIndexedCache, CacheKey, CacheValue, MultiProcessSafeIndexedCache,
    UnitOfWorkParticipant,
};
use crate::access::Releaser;
use crate::error::Result;
use crate::guard::ProducerGuard;
use crate::lock::LockState;

/// Reads run on (or wait for) the worker; writes are queued on it
pub struct AsyncCacheAccessDecoratedCache<K, V> {
    worker: Arc<AsyncCacheAccessWorker>,
    persistent: Arc<dyn MultiProcessSafeIndexedCache<K, V>>,
    producers: ProducerGuard<K>,
}

impl<K: CacheKey, V> AsyncCacheAccessDecoratedCache<K, V> {
    pub fn new(
        worker: Arc<AsyncCacheAccessWorker>,
        persistent: Arc<dyn MultiProcessSafeIndexedCache<K, V>>,
    ) -> Self {
        Self {
            worker,
            persistent,
            producers: ProducerGuard::adaptive(),
        }
    }
}

impl<K: CacheKey, V: CacheValue> UnitOfWorkParticipant for AsyncCacheAccessDecoratedCache<K, V> {
    fn after_lock_acquire(&self, state: &LockState) {
        self.persistent.after_lock_acquire(state);
    }

    fn finish_work(&self) {
        self.persistent.finish_work();
    }

    fn before_lock_release(&self, state: &LockState) {
        self.persistent.before_lock_release(state);
    }
}

impl<K: CacheKey, V: CacheValue> AsyncIndexedCache<K, V> for AsyncCacheAccessDecoratedCache<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        let persistent = self.persistent.clone();
        let key = key.clone();
        self.worker.read(move || persistent.get(&key))
    }

    fn get_or_create(
        &self,
        key: &K,
        producer: &dyn Fn(&K) -> Result<V>,
        completion: Releaser,
    ) -> Result<V> {
        let produce = move || -> Result<V> {
            if let Some(value) = self.get(key)? {
                completion.release();
                return Ok(value);
            }
            let value = producer(key)?;
            self.put_later(key.clone(), value.clone(), completion)?;
            Ok(value)
        };
        // The owner runs unguarded: a guarded waiter may be queued on the
        // worker, which cannot run until the owner is done
        if self.worker.is_owned_by_current_thread() {
            return produce();
        }
        // Reads queue behind earlier writes, so a waiter sees the value
        // its predecessor produced
        self.producers.guard_by_key(key, produce)
    }

    fn put_later(&self, key: K, value: V, completion: Releaser) -> Result<()> {
        let persistent = self.persistent.clone();
        self.worker.enqueue(move || {
            let result = persistent.put(key, value);
            completion.release();
            result
        })
    }

    fn remove_later(&self, key: K, completion: Releaser) -> Result<()> {
        let persistent = self.persistent.clone();
        self.worker.enqueue(move || {
            let result = persistent.remove(&key);
            completion.release();
            result
        })
    }
}
