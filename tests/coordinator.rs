//! Cache Coordinator Integration Tests
//!
//! Coordinators built on separate `FileLockManager`s stand in for separate
//! processes sharing one cache directory.

#![cfg(target_os = "linux")]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use persistent_cache::cleanup::{
    CleanableStore, CleanupAction, CleanupFrequency, CleanupProgressMonitor, DefaultCacheCleanupExecutor,
};
use persistent_cache::indexed::InMemoryCacheDecoratorFactory;
use persistent_cache::store::{JsonSerializer, Serializer, StringSerializer};
use persistent_cache::{
    CacheCoordinator, CacheSettings, Error, FileLockManager, IndexedCacheParameters, InMemoryDecoratorConfig,
    LockMode,
};

fn settings() -> CacheSettings {
    CacheSettings {
        lock_timeout_ms: 10_000,
        short_lock_timeout_ms: 2_000,
        batch_window_ms: 20,
        max_locking_time_ms: 500,
        ..CacheSettings::default()
    }
}

fn coordinator(dir: &Path, factory: Option<Arc<InMemoryCacheDecoratorFactory>>) -> CacheCoordinator {
    let settings = settings();
    let mut builder = CacheCoordinator::builder("build cache", dir)
        .lock_mode(LockMode::OnDemand)
        .lock_manager(FileLockManager::standalone(&settings))
        .settings(settings);
    if let Some(factory) = factory {
        builder = builder.decorator_factory(factory);
    }
    builder.build()
}

fn plain() -> IndexedCacheParameters<String, u64> {
    IndexedCacheParameters::new("hashes", StringSerializer, JsonSerializer::new())
}

fn decorated() -> IndexedCacheParameters<String, u64> {
    plain().with_decorator(InMemoryDecoratorConfig::new(100))
}

// =============================================================================
// Decorated caches
// =============================================================================

mod decorated_tests {
    use super::*;

    #[test]
    fn test_closing_applies_queued_writes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = coordinator(dir.path(), None);
        writer.open().unwrap();
        let cache = writer.new_cache(&decorated()).unwrap();
        for i in 0..50u64 {
            cache.put(format!("key-{}", i), i).unwrap();
        }
        assert_eq!(cache.get(&"key-7".to_string()).unwrap(), Some(7));
        writer.close().unwrap();

        let reader = coordinator(dir.path(), None);
        reader.open().unwrap();
        let cache = reader.new_cache(&decorated()).unwrap();
        for i in 0..50u64 {
            assert_eq!(cache.get(&format!("key-{}", i)).unwrap(), Some(i));
        }
        assert!(reader.cache_exists(&decorated()));
        reader.close().unwrap();
    }

    #[test]
    fn test_get_or_create_produces_once() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), None);
        coordinator.open().unwrap();
        let cache = coordinator.new_cache(&decorated()).unwrap();
        let produced = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_create(&"answer".to_string(), |_| {
                    produced.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(produced.load(Ordering::SeqCst), 1);
        coordinator.close().unwrap();
    }

    fn produce_concurrently(coordinator: &CacheCoordinator) -> usize {
        let cache = coordinator.new_cache(&decorated()).unwrap();
        let produced = AtomicUsize::new(0);
        let barrier = std::sync::Barrier::new(4);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    barrier.wait();
                    let value = cache
                        .get_or_create(&"answer".to_string(), |_| {
                            produced.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(50));
                            Ok(42)
                        })
                        .unwrap();
                    assert_eq!(value, 42);
                });
            }
        });
        produced.load(Ordering::SeqCst)
    }

    #[test]
    fn test_concurrent_get_or_create_produces_once() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), None);
        coordinator.open().unwrap();
        assert_eq!(produce_concurrently(&coordinator), 1);
        coordinator.close().unwrap();
    }

    #[test]
    fn test_concurrent_get_or_create_without_memory_layer() {
        let dir = tempfile::tempdir().unwrap();
        let short_lived = Arc::new(InMemoryCacheDecoratorFactory::from_settings(false, &settings()));
        let coordinator = coordinator(dir.path(), Some(short_lived));
        coordinator.open().unwrap();
        assert_eq!(produce_concurrently(&coordinator), 1);
        coordinator.close().unwrap();
    }

    #[test]
    fn test_foreign_update_invalidates_memory() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(InMemoryCacheDecoratorFactory::from_settings(true, &settings()));

        let first = coordinator(dir.path(), Some(factory.clone()));
        first.open().unwrap();
        let cache = first.new_cache(&decorated()).unwrap();
        cache.put("k".to_string(), 1).unwrap();
        assert_eq!(cache.get(&"k".to_string()).unwrap(), Some(1));
        first.close().unwrap();

        // Another process rewrites the entry on disk
        let other = coordinator(dir.path(), None);
        other.open().unwrap();
        let foreign = other.new_cache(&plain()).unwrap();
        other.use_cache(|| foreign.put("k".to_string(), 2)).unwrap();
        other.close().unwrap();

        // Same process again, sharing the in-memory layer with `first`
        let again = coordinator(dir.path(), Some(factory));
        again.open().unwrap();
        let cache = again.new_cache(&decorated()).unwrap();
        assert_eq!(cache.get(&"k".to_string()).unwrap(), Some(2));
        again.close().unwrap();
    }
}

// =============================================================================
// Interrupted writes
// =============================================================================

mod integrity_tests {
    use super::*;

    /// Refuses to encode `u64::MAX`
    struct Checked;

    impl Serializer<u64> for Checked {
        fn write(&self, value: &u64) -> persistent_cache::Result<Vec<u8>> {
            if *value == u64::MAX {
                return Err(Error::Serialization("value out of range".to_string()));
            }
            Ok(value.to_be_bytes().to_vec())
        }

        fn read(&self, bytes: &[u8]) -> persistent_cache::Result<u64> {
            let bytes: [u8; 8] = bytes
                .try_into()
                .map_err(|_| Error::Serialization(format!("expected 8 bytes, got {}", bytes.len())))?;
            Ok(u64::from_be_bytes(bytes))
        }
    }

    fn checked() -> IndexedCacheParameters<String, u64> {
        IndexedCacheParameters::new("checked", StringSerializer, Checked)
    }

    #[test]
    fn test_failed_write_is_not_trusted_until_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), None);
        coordinator.open().unwrap();
        let cache = coordinator.new_cache(&checked()).unwrap();

        coordinator
            .use_cache(|| {
                cache.put("a".to_string(), 1)?;
                assert_eq!(cache.get(&"a".to_string())?, Some(1));

                let failed = cache.put("b".to_string(), u64::MAX);
                assert!(matches!(failed, Err(Error::Serialization(_))));
                // The interrupted write leaves the cache untrusted
                assert_eq!(cache.get(&"a".to_string())?, None);

                cache.put("c".to_string(), 3)?;
                assert_eq!(cache.get(&"a".to_string())?, Some(1));
                assert_eq!(cache.get(&"c".to_string())?, Some(3));
                Ok(())
            })
            .unwrap();
        coordinator.close().unwrap();
    }

    #[test]
    fn test_failed_queued_write_surfaces_on_close_and_store_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let params = checked().with_decorator(InMemoryDecoratorConfig::new(100));

        let writer = coordinator(dir.path(), None);
        writer.open().unwrap();
        let cache = writer.new_cache(&params).unwrap();
        cache.put("a".to_string(), 1).unwrap();
        cache.put("b".to_string(), u64::MAX).unwrap();
        assert!(matches!(writer.close(), Err(Error::Serialization(_))));

        // Opening the store rewrites it, so the next session trusts it again
        let reader = coordinator(dir.path(), None);
        reader.open().unwrap();
        let cache = reader.new_cache(&checked()).unwrap();
        let (a, b) = reader
            .use_cache(|| Ok((cache.get(&"a".to_string())?, cache.get(&"b".to_string())?)))
            .unwrap();
        assert_eq!(a, Some(1));
        assert_eq!(b, None);
        reader.close().unwrap();
    }
}

// =============================================================================
// Two processes
// =============================================================================

mod contention_tests {
    use super::*;

    #[test]
    fn test_on_demand_coordinators_take_turns() {
        let dir = tempfile::tempdir().unwrap();
        let first = coordinator(dir.path(), None);
        let second = coordinator(dir.path(), None);
        first.open().unwrap();
        second.open().unwrap();
        let a = first.new_cache(&plain()).unwrap();
        let b = second.new_cache(&plain()).unwrap();

        first.use_cache(|| a.put("from-first".to_string(), 1)).unwrap();
        // `first` keeps its lock until `second` asks for it
        let seen = second.use_cache(|| b.get(&"from-first".to_string())).unwrap();
        assert_eq!(seen, Some(1));

        second.use_cache(|| b.put("from-second".to_string(), 2)).unwrap();
        let seen = first.use_cache(|| a.get(&"from-second".to_string())).unwrap();
        assert_eq!(seen, Some(2));

        first.close().unwrap();
        second.close().unwrap();
    }
}

// =============================================================================
// Cleanup
// =============================================================================

mod cleanup_tests {
    use super::*;

    struct CountingCleanup(Arc<AtomicUsize>);

    impl CleanupAction for CountingCleanup {
        fn clean(
            &self,
            _store: &CleanableStore,
            _monitor: &CleanupProgressMonitor,
        ) -> persistent_cache::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn with_cleanup(dir: &Path, runs: &Arc<AtomicUsize>) -> CacheCoordinator {
        std::fs::write(dir.join("gc.properties"), b"").unwrap();
        let executor = DefaultCacheCleanupExecutor::new(
            CleanableStore::new("build cache", dir),
            Arc::new(CountingCleanup(runs.clone())),
            CleanupFrequency::Always,
        );
        CacheCoordinator::builder("build cache", dir)
            .lock_mode(LockMode::Exclusive)
            .settings(settings())
            .cleanup(Arc::new(executor))
            .build()
    }

    #[test]
    fn test_cleanup_runs_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let coordinator = with_cleanup(dir.path(), &runs);
        coordinator.open().unwrap();
        coordinator.close().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_cleanup_is_not_repeated_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let coordinator = with_cleanup(dir.path(), &runs);
        coordinator.open().unwrap();
        coordinator.cleanup().unwrap();
        coordinator.close().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
