//! Holds the cross-process file lock around each cache call

use std::sync::Arc;

use super::{
    AsyncIndexedCache, CacheKey, CacheValue, MultiProcessSafeIndexedCache, UnitOfWorkParticipant,
};
use crate::access::{CacheAccess, CrossProcessCacheAccess};
use crate::error::Result;
use crate::lock::LockState;

/// Reads hold the file lock for their duration. Writes acquire it up front
/// and hand the releaser to the queued write, so the lock stays held until
/// the write has been applied.
pub struct CrossProcessSynchronizingIndexedCache<K, V> {
    target: Arc<dyn AsyncIndexedCache<K, V>>,
    access: Arc<CacheAccess>,
}

impl<K, V> CrossProcessSynchronizingIndexedCache<K, V> {
    pub fn new(target: Arc<dyn AsyncIndexedCache<K, V>>, access: Arc<CacheAccess>) -> Self {
        Self { target, access }
    }
}

impl<K: CacheKey, V: CacheValue> UnitOfWorkParticipant for CrossProcessSynchronizingIndexedCache<K, V> {
    fn after_lock_acquire(&self, state: &LockState) {
        self.target.after_lock_acquire(state);
    }

    fn finish_work(&self) {
        self.target.finish_work();
    }

    fn before_lock_release(&self, state: &LockState) {
        self.target.before_lock_release(state);
    }
}

impl<K: CacheKey, V: CacheValue> MultiProcessSafeIndexedCache<K, V>
    for CrossProcessSynchronizingIndexedCache<K, V>
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        self.access.with_file_lock(|| self.target.get(key))
    }

    fn get_or_create(&self, key: &K, producer: &dyn Fn(&K) -> Result<V>) -> Result<V> {
        let releaser = self.access.acquire_file_lock()?;
        self.target.get_or_create(key, producer, releaser)
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        let releaser = self.access.acquire_file_lock()?;
        self.target.put_later(key, value, releaser)
    }

    fn remove(&self, key: &K) -> Result<()> {
        let releaser = self.access.acquire_file_lock()?;
        self.target.remove_later(key.clone(), releaser)
    }
}
