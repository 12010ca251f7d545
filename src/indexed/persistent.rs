//! The persistent layer: an indexed store reached through the coordinator

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::{CacheKey, CacheValue, MultiProcessSafeIndexedCache, UnitOfWorkParticipant};
use crate::coordinator::FileAccess;
use crate::error::{Error, Result};
use crate::store::{IndexedStore, IndexedStoreFactory, Serializer};

/// Opens its store lazily in each unit of work and closes it when the work
/// finishes, so the next unit of work sees what other processes wrote
pub struct PersistentIndexedCache<K, V> {
    cache_file: PathBuf,
    factory: Arc<dyn IndexedStoreFactory>,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
    file_access: FileAccess,
    store: Mutex<Option<IndexedStore<K, V>>>,
}

impl<K, V> std::fmt::Debug for PersistentIndexedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentIndexedCache")
            .field("cache_file", &self.cache_file)
            .field("open", &self.store.lock().is_some())
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> PersistentIndexedCache<K, V> {
    pub fn new(
        cache_file: &Path,
        factory: Arc<dyn IndexedStoreFactory>,
        key_serializer: Arc<dyn Serializer<K>>,
        value_serializer: Arc<dyn Serializer<V>>,
        file_access: FileAccess,
    ) -> Self {
        Self {
            cache_file: cache_file.to_path_buf(),
            factory,
            key_serializer,
            value_serializer,
            file_access,
            store: Mutex::new(None),
        }
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    fn create_store(&self) -> Result<IndexedStore<K, V>> {
        let raw = self.factory.open(&self.cache_file)?;
        Ok(IndexedStore::new(
            raw,
            self.key_serializer.clone(),
            self.value_serializer.clone(),
        ))
    }

    /// Open the store if this unit of work has not yet. Opening counts as a
    /// write: the store recovers from a torn tail on its own.
    fn open_store(&self) -> Result<()> {
        if self.store.lock().is_some() {
            return Ok(());
        }
        let created = match self.file_access.write_file(|| self.create_store()) {
            Err(Error::InsufficientLockMode(_)) => self.create_store()?,
            other => other?,
        };
        debug!("Opened cache file {}", self.cache_file.display());
        *self.store.lock() = Some(created);
        Ok(())
    }

    fn store(&self) -> Result<MappedMutexGuard<'_, IndexedStore<K, V>>> {
        MutexGuard::try_map(self.store.lock(), |store| store.as_mut()).map_err(|_| {
            Error::IllegalLockState(format!(
                "cache file {} is not open",
                self.cache_file.display()
            ))
        })
    }
}

impl<K: CacheKey, V: CacheValue> UnitOfWorkParticipant for PersistentIndexedCache<K, V> {
    fn finish_work(&self) {
        let store = self.store.lock().take();
        if let Some(mut store) = store {
            if let Err(e) = store.close() {
                warn!("Failed to close cache file {}: {}", self.cache_file.display(), e);
            }
        }
    }
}

impl<K: CacheKey, V: CacheValue> MultiProcessSafeIndexedCache<K, V> for PersistentIndexedCache<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        self.open_store()?;
        match self.file_access.read_file(|| self.store()?.get(key)) {
            Err(Error::FileIntegrityViolation(_)) => Ok(None),
            other => other,
        }
    }

    fn get_or_create(&self, key: &K, producer: &dyn Fn(&K) -> Result<V>) -> Result<V> {
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }
        let value = producer(key)?;
        self.put(key.clone(), value.clone())?;
        Ok(value)
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        self.open_store()?;
        self.file_access
            .write_file(|| self.store()?.put(&key, &value))
    }

    fn remove(&self, key: &K) -> Result<()> {
        self.open_store()?;
        self.file_access.write_file(|| self.store()?.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AppendLogStoreFactory, JsonSerializer, StringSerializer};

    fn cache(dir: &Path) -> PersistentIndexedCache<String, u32> {
        PersistentIndexedCache::new(
            &dir.join("counts.bin"),
            Arc::new(AppendLogStoreFactory),
            Arc::new(StringSerializer),
            Arc::new(JsonSerializer::new()),
            FileAccess::Transparent,
        )
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        cache.put("a".to_string(), 1).unwrap();
        assert_eq!(cache.get(&"a".to_string()).unwrap(), Some(1));
        cache.remove(&"a".to_string()).unwrap();
        assert_eq!(cache.get(&"a".to_string()).unwrap(), None);
    }

    #[test]
    fn test_finish_work_persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        cache.put("a".to_string(), 7).unwrap();
        cache.finish_work();
        assert!(dir.path().join("counts.bin").exists());

        let other = self::cache(dir.path());
        assert_eq!(other.get(&"a".to_string()).unwrap(), Some(7));
    }

    #[test]
    fn test_get_or_create_produces_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let producer = |key: &String| -> Result<u32> {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(key.len() as u32)
        };
        assert_eq!(cache.get_or_create(&"four".to_string(), &producer).unwrap(), 4);
        assert_eq!(cache.get_or_create(&"four".to_string(), &producer).unwrap(), 4);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
