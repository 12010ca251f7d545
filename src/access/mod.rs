//! Cross-Process Cache Access
//!
//! Strategies deciding *when* the cross-process file lock of a cache is held.
//!
//! # Design
//!
//! ```text
//!                    ┌───────────────────────────────────────────────┐
//!                    │                 CacheAccess                   │
//!                    ├───────────────┬──────────────┬────────────────┤
//!                    │ Fixed         │ OnDemand     │ None           │
//!                    │ Shared /      │ lock on 0→1, │ no OS lock,    │
//!                    │ Exclusive     │ release on   │ finish-work on │
//!                    │ open → close  │ contention   │ every release  │
//!                    └──────┬────────┴──────┬───────┴────────────────┘
//!                           │ lock/close    │
//!                           ▼               ▼
//!                       FileLockManager   LockObserver (after acquire /
//!                                          before release / finish work)
//! ```
//!
//! Observers are held weakly and are invoked synchronously; they must not
//! call back into the access strategy or the coordinator that owns it.

mod fixed;
mod init;
mod none;
mod on_demand;

pub use fixed::FixedCacheAccess;
pub use init::{
    CacheInitializationAction, NoOpInitialization, PropertiesInitialization,
    RebuildOnDirtyInitialization, CACHE_PROPERTIES_FILE,
};
pub use none::NoLockingCacheAccess;
pub use on_demand::OnDemandCacheAccess;

use std::path::Path;
use std::sync::{Arc, Weak};

use crate::error::Result;
use crate::lock::{FileLock, FileLockManager, LockMode, LockOptions};

// =============================================================================
// Releaser
// =============================================================================

/// Undoes an acquisition exactly once: on [`Releaser::release`] or on drop
pub struct Releaser(Option<Box<dyn FnOnce() + Send>>);

impl Releaser {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Releaser(Some(Box::new(release)))
    }

    /// A releaser that does nothing
    pub fn noop() -> Self {
        Releaser(None)
    }

    pub fn release(mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl Drop for Releaser {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Releaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Releaser").field(&self.0.is_some()).finish()
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Receives lock lifecycle notifications from an access strategy
pub trait LockObserver: Send + Sync {
    /// Called right after the file lock has been acquired
    fn after_lock_acquire(&self, lock: &Arc<FileLock>);

    /// Called right before the file lock is released
    fn before_lock_release(&self, lock: &Arc<FileLock>);

    /// Called at the end of a unit of work that held no file lock
    fn finish_work(&self);
}

pub(crate) fn notify_acquire(observer: &Weak<dyn LockObserver>, lock: &Arc<FileLock>) {
    if let Some(observer) = observer.upgrade() {
        observer.after_lock_acquire(lock);
    }
}

pub(crate) fn notify_release(observer: &Weak<dyn LockObserver>, lock: &Arc<FileLock>) {
    if let Some(observer) = observer.upgrade() {
        observer.before_lock_release(lock);
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// Contract shared by all access strategies
pub trait CrossProcessCacheAccess: Send + Sync {
    /// Prepare the strategy; fixed strategies lock here
    fn open(&self) -> Result<()>;

    /// Release everything held. Idempotent.
    fn close(&self);

    /// Make sure the file lock is held until the returned releaser runs
    fn acquire_file_lock(&self) -> Result<Releaser>;

    /// Run `action` while the file lock is held
    fn with_file_lock<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T>
    where
        Self: Sized,
    {
        let releaser = self.acquire_file_lock()?;
        let value = action();
        releaser.release();
        value
    }
}

/// The strategy selected for a coordinator's lock mode
pub enum CacheAccess {
    Fixed(FixedCacheAccess),
    OnDemand(OnDemandCacheAccess),
    None(NoLockingCacheAccess),
}

impl CacheAccess {
    /// Select the strategy for `options.mode`
    pub fn for_mode(
        display_name: &str,
        target: &Path,
        options: LockOptions,
        manager: FileLockManager,
        initializer: Arc<dyn CacheInitializationAction>,
        observer: Weak<dyn LockObserver>,
    ) -> Self {
        match options.mode {
            LockMode::Shared | LockMode::Exclusive => CacheAccess::Fixed(FixedCacheAccess::new(
                display_name,
                target,
                options,
                manager,
                initializer,
                observer,
            )),
            LockMode::OnDemand => CacheAccess::OnDemand(OnDemandCacheAccess::new(
                display_name,
                target,
                options.with_mode(LockMode::Exclusive),
                manager,
                initializer,
                observer,
            )),
            LockMode::None => CacheAccess::None(NoLockingCacheAccess::new(observer)),
        }
    }

    fn strategy(&self) -> &dyn CrossProcessCacheAccess {
        match self {
            CacheAccess::Fixed(access) => access,
            CacheAccess::OnDemand(access) => access,
            CacheAccess::None(access) => access,
        }
    }
}

impl CrossProcessCacheAccess for CacheAccess {
    fn open(&self) -> Result<()> {
        self.strategy().open()
    }

    fn close(&self) {
        self.strategy().close()
    }

    fn acquire_file_lock(&self) -> Result<Releaser> {
        self.strategy().acquire_file_lock()
    }
}

/// Run the initialization action under a write if the lock asks for it
pub(crate) fn initialize_if_required(
    initializer: &dyn CacheInitializationAction,
    lock: &FileLock,
) -> Result<bool> {
    if initializer.requires_initialization(lock)? {
        lock.write_file(|| initializer.initialize(lock))?;
        return Ok(true);
    }
    Ok(false)
}

// =============================================================================
// Tests
// =============================================================================
