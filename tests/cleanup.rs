//! Cleanup Integration Tests
//!
//! Time-based cleanup is driven by a `ManualClock`; a second
//! `FileLockManager` stands in for a second process.

#![cfg(target_os = "linux")]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use persistent_cache::cleanup::{
    soft_deleted_at, CacheCleanupExecutor, CleanableStore, CleanupFrequency, Clock, CompositeCleanupAction,
    DefaultCacheCleanupExecutor, FileAccessTimeJournal, IndexedFileAccessTimeJournal,
    LeastRecentlyUsedCacheCleanup, ManualClock,
};
use persistent_cache::{CacheSettings, FileLockManager, FineGrainedCache};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

fn start() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn settings() -> CacheSettings {
    CacheSettings {
        lock_timeout_ms: 2_000,
        contention_pings: false,
        cleanup_frequency: CleanupFrequency::Daily,
        lru_retention_days: 7,
        soft_delete_grace_secs: 3600,
        hard_delete_delay_secs: 0,
        ..CacheSettings::default()
    }
}

fn fine_grained(dir: &Path, clock: &Arc<ManualClock>) -> FineGrainedCache {
    let settings = settings();
    let journal = Arc::new(
        IndexedFileAccessTimeJournal::open(&dir.join(".internal").join("journal.json"), clock.clone())
            .unwrap(),
    );
    FineGrainedCache::open(
        "transforms",
        dir,
        FileLockManager::standalone(&settings),
        journal,
        settings,
    )
    .unwrap()
    .with_clock(clock.clone())
}

fn produce(cache: &FineGrainedCache, key: &str) {
    cache
        .use_cache(key, |entry| {
            if !entry.exists() {
                fs::create_dir_all(entry)?;
                fs::write(entry.join("out.bin"), key.as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
}

// =============================================================================
// Gated LRU cleanup
// =============================================================================

mod lru_tests {
    use super::*;

    #[test]
    fn test_daily_lru_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("cache");
        for name in ["kept", "stale"] {
            fs::create_dir_all(base.join(name)).unwrap();
        }
        let clock = Arc::new(ManualClock::new(start()));
        let journal = Arc::new(
            IndexedFileAccessTimeJournal::open(&root.path().join("journal.json"), clock.clone()).unwrap(),
        );
        let lru = LeastRecentlyUsedCacheCleanup::new(1, journal.clone(), DAY * 7, clock.clone());
        let executor = DefaultCacheCleanupExecutor::new(
            CleanableStore::new("cache", &base),
            Arc::new(CompositeCleanupAction::new().add(Arc::new(lru))),
            CleanupFrequency::Daily,
        )
        .with_clock(clock.clone());

        // First run only creates the marker
        executor.cleanup().unwrap();
        assert!(base.join("gc.properties").exists());

        clock.advance(DAY * 10);
        journal.set_last_access_time(&base.join("kept"), clock.now()).unwrap();
        executor.cleanup().unwrap();
        assert!(base.join("kept").exists());
        assert!(!base.join("stale").exists());
        assert!(base.join("gc.properties").exists());
    }
}

// =============================================================================
// Fine-grained mark and sweep
// =============================================================================

mod mark_sweep_tests {
    use super::*;

    #[test]
    fn test_grace_period_and_unstale() {
        let root = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let cache = fine_grained(root.path(), &clock);
        produce(&cache, "used");
        produce(&cache, "unused");

        clock.advance(DAY * 8);
        cache.sweep().unwrap();
        assert!(soft_deleted_at(root.path(), "used").unwrap().is_some());
        assert!(soft_deleted_at(root.path(), "unused").unwrap().is_some());

        // Reading within the grace period cancels the pending delete
        clock.advance(HOUR / 2);
        produce(&cache, "used");
        assert!(soft_deleted_at(root.path(), "used").unwrap().is_none());

        clock.advance(HOUR / 2 + Duration::from_secs(60));
        let monitor = cache.sweep().unwrap();
        assert_eq!(monitor.deleted(), 1);
        assert!(cache.entry("used").exists());
        assert!(!cache.entry("unused").exists());
    }

    #[test]
    fn test_entry_held_by_other_process_survives_sweep() {
        let root = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let worker = fine_grained(root.path(), &clock);
        let janitor = fine_grained(root.path(), &clock);
        produce(&worker, "busy");

        clock.advance(DAY * 8);
        janitor.sweep().unwrap();
        clock.advance(HOUR * 2);

        let (entered_tx, entered_rx) = crossbeam::channel::bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam::channel::bounded::<()>(0);
        let holder = std::thread::spawn(move || {
            worker
                .use_cache("busy", |_| {
                    entered_tx.send(()).unwrap();
                    done_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        });
        entered_rx.recv().unwrap();

        // Re-mark as expired while the entry is in use elsewhere
        let marker = root.path().join(".internal/gc/busy/soft.deleted");
        fs::create_dir_all(marker.parent().unwrap()).unwrap();
        fs::write(&marker, b"0").unwrap();
        let monitor = janitor.sweep().unwrap();
        assert_eq!(monitor.deleted(), 0);
        assert!(janitor.entry("busy").exists());

        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }
}
