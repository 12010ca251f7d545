//! Fixed-mode access: the lock is taken at open and held until close

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    initialize_if_required, notify_acquire, notify_release, CacheInitializationAction,
    CrossProcessCacheAccess, LockObserver, Releaser,
};
use crate::error::{Error, Result};
use crate::lock::{FileLock, FileLockManager, LockMode, LockOptions};

/// Attempts a shared opener makes at getting the cache initialized
const MAX_INITIALIZATION_ATTEMPTS: usize = 3;

/// Holds a shared or exclusive lock for the whole time the cache is open
pub struct FixedCacheAccess {
    display_name: String,
    target: PathBuf,
    options: LockOptions,
    manager: FileLockManager,
    initializer: Arc<dyn CacheInitializationAction>,
    observer: Weak<dyn LockObserver>,
    lock: Mutex<Option<Arc<FileLock>>>,
}

impl FixedCacheAccess {
    pub fn new(
        display_name: &str,
        target: &Path,
        options: LockOptions,
        manager: FileLockManager,
        initializer: Arc<dyn CacheInitializationAction>,
        observer: Weak<dyn LockObserver>,
    ) -> Self {
        Self {
            display_name: display_name.to_string(),
            target: target.to_path_buf(),
            options,
            manager,
            initializer,
            observer,
            lock: Mutex::new(None),
        }
    }

    /// The lock held while open
    pub fn file_lock(&self) -> Option<Arc<FileLock>> {
        self.lock.lock().clone()
    }

    fn lock_in(&self, mode: LockMode) -> Result<FileLock> {
        self.manager
            .lock(&self.target, self.options.with_mode(mode), &self.display_name)
    }

    fn open_exclusive(&self) -> Result<FileLock> {
        let lock = self.lock_in(LockMode::Exclusive)?;
        initialize_if_required(self.initializer.as_ref(), &lock)?;
        Ok(lock)
    }

    /// Shared openers cannot write, so a cache needing initialization is
    /// handed to a short exclusive lock and then re-opened shared
    fn open_shared(&self) -> Result<FileLock> {
        let mut lock = self.lock_in(LockMode::Shared)?;
        let mut attempts = 0;
        while self.initializer.requires_initialization(&lock)? {
            if attempts == MAX_INITIALIZATION_ATTEMPTS {
                return Err(Error::CacheOpen {
                    display_name: self.display_name.clone(),
                    reason: format!(
                        "initialization did not complete after {} attempts",
                        attempts
                    ),
                });
            }
            attempts += 1;
            debug!(
                "Escalating to an exclusive lock to initialize {} (attempt {})",
                self.display_name, attempts
            );
            lock.close();
            {
                let exclusive = self.lock_in(LockMode::Exclusive)?;
                initialize_if_required(self.initializer.as_ref(), &exclusive)?;
            }
            lock = self.lock_in(LockMode::Shared)?;
        }
        Ok(lock)
    }
}

impl CrossProcessCacheAccess for FixedCacheAccess {
    fn open(&self) -> Result<()> {
        let mut held = self.lock.lock();
        if held.is_some() {
            return Err(Error::AlreadyOpen(self.display_name.clone()));
        }
        let lock = match self.options.mode {
            LockMode::Shared => self.open_shared()?,
            _ => self.open_exclusive()?,
        };
        let lock = Arc::new(lock);
        notify_acquire(&self.observer, &lock);
        *held = Some(lock);
        Ok(())
    }

    fn close(&self) {
        let lock = self.lock.lock().take();
        if let Some(lock) = lock {
            notify_release(&self.observer, &lock);
            lock.close();
        }
    }

    fn acquire_file_lock(&self) -> Result<Releaser> {
        if self.lock.lock().is_none() {
            return Err(Error::NotOpen(self.display_name.clone()));
        }
        Ok(Releaser::noop())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::access::{NoOpInitialization, RebuildOnDirtyInitialization};
    use crate::lock::{ContentionHandler, LockedFiles};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager() -> FileLockManager {
        FileLockManager::with_timeouts(
            Arc::new(LockedFiles::new()),
            Arc::new(ContentionHandler::disabled()),
            Duration::from_millis(300),
            Duration::from_millis(300),
        )
    }

    fn no_observer() -> Weak<dyn LockObserver> {
        Weak::<crate::coordinator::CacheRegistry>::new()
    }

    #[test]
    fn test_exclusive_open_initializes_dirty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let init = Arc::new(RebuildOnDirtyInitialization::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let access = FixedCacheAccess::new(
            "cache",
            dir.path(),
            LockOptions::mode(LockMode::Exclusive),
            manager(),
            init.clone(),
            no_observer(),
        );
        access.open().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(access.file_lock().unwrap().unlocked_cleanly().unwrap());
        access.close();

        access.open().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        access.close();
    }

    #[test]
    fn test_shared_open_escalates_for_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let init = Arc::new(RebuildOnDirtyInitialization::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let access = FixedCacheAccess::new(
            "cache",
            dir.path(),
            LockOptions::mode(LockMode::Shared),
            manager(),
            init,
            no_observer(),
        );
        access.open().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let lock = access.file_lock().unwrap();
        assert_eq!(lock.mode(), LockMode::Shared);
        assert!(lock.unlocked_cleanly().unwrap());
    }

    struct NeverSatisfied;

    impl CacheInitializationAction for NeverSatisfied {
        fn requires_initialization(&self, _lock: &FileLock) -> Result<bool> {
            Ok(true)
        }

        fn initialize(&self, _lock: &FileLock) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_shared_open_gives_up_after_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let access = FixedCacheAccess::new(
            "cache",
            dir.path(),
            LockOptions::mode(LockMode::Shared),
            mgr.clone(),
            Arc::new(NeverSatisfied),
            no_observer(),
        );
        assert_matches!(access.open(), Err(Error::CacheOpen { .. }));
        assert!(mgr.registry().is_empty());
    }

    #[test]
    fn test_acquire_requires_open() {
        let dir = tempfile::tempdir().unwrap();
        let access = FixedCacheAccess::new(
            "cache",
            dir.path(),
            LockOptions::mode(LockMode::Exclusive),
            manager(),
            Arc::new(NoOpInitialization),
            no_observer(),
        );
        assert_matches!(access.acquire_file_lock(), Err(Error::NotOpen(_)));
        access.open().unwrap();
        assert_eq!(access.with_file_lock(|| Ok(5)).unwrap(), 5);
    }
}
