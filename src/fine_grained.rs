//! Fine-Grained Cache
//!
//! A cache directory whose entries are used independently: each key has its
//! own cross-process lock, so processes working on different keys never wait
//! for each other.
//!
//! # Design
//!
//! ```text
//!   use_cache("k", action)
//!     │ ProducerGuard        one thread per key in this process
//!     │ locks/k.lock         one process per key (exclusive)
//!     │ un-stale             drop .internal/gc/k/soft.deleted
//!     │ action(<dir>/k)
//!     │ journal              record access for cleanup
//!     ▼
//!   release
//! ```
//!
//! Unused entries are removed by [`MarkAndSweepCleanup`], which takes the
//! same per-key lock before deleting anything.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cleanup::{
    entry_lock_target, soft_delete_marker, CleanableStore, CleanupAction, CleanupProgressMonitor, Clock,
    DefaultCacheCleanupExecutor, FileAccessTimeJournal, MarkAndSweepCleanup, SystemClock, LOCKS_DIR,
};
use crate::config::CacheSettings;
use crate::error::{Error, Result};
use crate::guard::ProducerGuard;
use crate::lock::{FileLockManager, LockMode, LockOptions};

pub struct FineGrainedCache {
    display_name: String,
    base_dir: PathBuf,
    manager: FileLockManager,
    guard: ProducerGuard<String>,
    journal: Arc<dyn FileAccessTimeJournal>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
}

impl std::fmt::Debug for FineGrainedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FineGrainedCache")
            .field("display_name", &self.display_name)
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

impl FineGrainedCache {
    /// Open the cache at `base_dir`, creating the directory if needed
    pub fn open(
        display_name: &str,
        base_dir: &Path,
        manager: FileLockManager,
        journal: Arc<dyn FileAccessTimeJournal>,
        settings: CacheSettings,
    ) -> Result<Self> {
        fs::create_dir_all(base_dir.join(LOCKS_DIR))?;
        Ok(Self {
            display_name: display_name.to_string(),
            base_dir: base_dir.to_path_buf(),
            manager,
            guard: ProducerGuard::adaptive(),
            journal,
            clock: Arc::new(SystemClock),
            settings,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_guard(mut self, guard: ProducerGuard<String>) -> Self {
        self.guard = guard;
        self
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Location of the entry for `key`, which may not exist yet
    pub fn entry(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    /// Run `action` on the entry for `key` while holding its lock.
    ///
    /// A pending soft delete of the entry is cancelled.
    pub fn use_cache<T>(&self, key: &str, action: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        validate_key(key)?;
        self.guard.guard_by_key(&key.to_string(), || {
            let operation = format!("{} entry {}", self.display_name, key);
            let lock = self.manager.lock(
                &entry_lock_target(&self.base_dir, key),
                LockOptions::mode(LockMode::Exclusive),
                &operation,
            )?;
            self.unstale(key)?;

            let entry = self.entry(key);
            let result = action(&entry);
            if entry.exists() {
                if let Err(e) = self.journal.set_last_access_time(&entry, self.clock.now()) {
                    warn!("Could not record access to {}: {}", entry.display(), e);
                }
            }
            lock.close();
            result
        })
    }

    fn unstale(&self, key: &str) -> Result<()> {
        match fs::remove_file(soft_delete_marker(&self.base_dir, key)) {
            Ok(()) => {
                debug!("Cancelled soft delete of {} in {}", key, self.display_name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn store(&self) -> CleanableStore {
        CleanableStore::new(&self.display_name, &self.base_dir)
    }

    pub fn cleanup_action(&self) -> MarkAndSweepCleanup {
        MarkAndSweepCleanup::from_settings(&self.manager, self.journal.clone(), self.clock.clone(), &self.settings)
    }

    /// Executor running mark-and-sweep at the configured frequency
    pub fn cleanup_executor(&self) -> DefaultCacheCleanupExecutor {
        DefaultCacheCleanupExecutor::new(
            self.store(),
            Arc::new(self.cleanup_action()),
            self.settings.cleanup_frequency,
        )
        .with_clock(self.clock.clone())
    }

    /// Run one mark-and-sweep pass now
    pub fn sweep(&self) -> Result<CleanupProgressMonitor> {
        let monitor = CleanupProgressMonitor::new();
        self.cleanup_action().clean(&self.store(), &monitor)?;
        Ok(monitor)
    }
}

fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\'])
        || key == LOCKS_DIR
        || key.ends_with(".lock")
        || key.ends_with(".properties");
    if invalid {
        return Err(Error::Config(format!("invalid fine-grained cache key '{}'", key)));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cleanup::{soft_deleted_at, IndexedFileAccessTimeJournal, ManualClock};
    use assert_matches::assert_matches;
    use std::time::{Duration, SystemTime};

    const MINUTE: Duration = Duration::from_secs(60);

    fn open(dir: &Path, clock: Arc<ManualClock>) -> FineGrainedCache {
        let settings = CacheSettings {
            contention_pings: false,
            lru_retention_days: 1,
            soft_delete_grace_secs: 3600,
            hard_delete_delay_secs: 0,
            ..CacheSettings::default()
        };
        let journal = Arc::new(
            IndexedFileAccessTimeJournal::open(&dir.join(".internal/journal.json"), clock.clone()).unwrap(),
        );
        FineGrainedCache::open(
            "transforms",
            dir,
            FileLockManager::standalone(&settings),
            journal,
            settings,
        )
        .unwrap()
        .with_clock(clock)
    }

    fn write_entry(cache: &FineGrainedCache, key: &str) {
        cache
            .use_cache(key, |entry| {
                fs::create_dir_all(entry)?;
                fs::write(entry.join("output"), b"result")?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_invalid_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH)));
        for key in ["", ".internal", "a/b", "locks", "x.lock", "gc.properties"] {
            assert_matches!(cache.use_cache(key, |_| Ok(())), Err(Error::Config(_)));
        }
    }

    #[test]
    fn test_reuse_cancels_pending_delete() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000)));
        let cache = open(dir.path(), clock.clone());
        write_entry(&cache, "k");

        clock.advance(Duration::from_secs(2 * 86_400));
        cache.sweep().unwrap();
        assert!(soft_deleted_at(dir.path(), "k").unwrap().is_some());

        clock.advance(MINUTE * 30);
        cache
            .use_cache("k", |entry| {
                assert!(entry.exists());
                Ok(())
            })
            .unwrap();
        assert!(soft_deleted_at(dir.path(), "k").unwrap().is_none());

        clock.advance(MINUTE * 31);
        cache.sweep().unwrap();
        assert!(cache.entry("k").exists());
    }

    #[test]
    fn test_unused_entry_is_deleted_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000)));
        let cache = open(dir.path(), clock.clone());
        write_entry(&cache, "k");

        clock.advance(Duration::from_secs(2 * 86_400));
        cache.sweep().unwrap();
        clock.advance(MINUTE * 30);
        cache.sweep().unwrap();
        assert!(cache.entry("k").exists());

        clock.advance(MINUTE * 31);
        let monitor = cache.sweep().unwrap();
        assert_eq!(monitor.deleted(), 1);
        assert!(!cache.entry("k").exists());
        assert!(!dir.path().join(LOCKS_DIR).join("k.lock").exists());
    }

    #[test]
    fn test_entry_in_use_is_not_swept() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000)));
        let cache = open(dir.path(), clock.clone());
        write_entry(&cache, "k");
        clock.advance(Duration::from_secs(2 * 86_400));
        cache.sweep().unwrap();
        clock.advance(MINUTE * 61);

        // Re-marking under the entry lock keeps the marker, but the lock is held
        let swept = cache
            .use_cache("k", |_| {
                fs::create_dir_all(dir.path().join(".internal/gc/k"))?;
                fs::write(soft_delete_marker(dir.path(), "k"), b"0")?;
                cache.sweep()
            })
            .unwrap();
        assert_eq!(swept.deleted(), 0);
        assert!(cache.entry("k").exists());
    }
}
