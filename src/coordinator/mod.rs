//! Cache Coordinator
//!
//! Serializes the threads of one process around a shared cache directory
//! and wires the cross-process access strategy to the caches living in it.
//!
//! # Design
//!
//! ```text
//!   thread A ─┐                       ┌──────────────────────────────┐
//!   thread B ─┼─► use_cache(action) ─►│ Ownership (reentrant, one    │
//!   worker   ─┘                       │ owner thread, others wait)   │
//!                                     └──────────────┬───────────────┘
//!                                 outermost call only│acquire / release
//!                                                    ▼
//!                                     ┌──────────────────────────────┐
//!                                     │ CacheAccess                  │
//!                                     │ Fixed / OnDemand / None      │
//!                                     └──────────────┬───────────────┘
//!                                  lock acquired /   │ about to release
//!                                                    ▼
//!                                     ┌──────────────────────────────┐
//!                                     │ CacheRegistry                │
//!                                     │ indexed caches, in order of  │
//!                                     │ registration                 │
//!                                     └──────────────────────────────┘
//! ```
//!
//! Lifecycle: `open()` once, then any number of `use_cache`, `with_file_lock`
//! and `new_cache` calls, then `close()`. Closing stops the access worker
//! (applying everything queued), releases the lock and runs cleanup if it did
//! not run yet.

mod file_access;
mod ownership;
mod params;
mod registry;

pub use file_access::{FileAccess, LockSlot};
pub use ownership::Ownership;
pub use params::IndexedCacheParameters;
pub use registry::CacheRegistry;

use std::any::type_name;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::access::{
    CacheAccess, CacheInitializationAction, CrossProcessCacheAccess, LockObserver,
    NoOpInitialization,
};
use crate::cleanup::CacheCleanupExecutor;
use crate::config::CacheSettings;
use crate::error::{Error, Result};
use crate::indexed::{
    AsyncCacheAccessWorker, CacheKey, CacheValue, ExclusiveAccess, InMemoryCacheDecoratorFactory,
    IndexedCache, MultiProcessSafeIndexedCache, PersistentIndexedCache, UnitOfWorkParticipant,
};
use crate::lock::{FileLockManager, LockMode, LockOptions};
use crate::store::{AppendLogStoreFactory, IndexedStoreFactory};
use params::CacheSignature;
use registry::CacheEntry;

// =============================================================================
// Builder
// =============================================================================

/// Configures a [`CacheCoordinator`]
pub struct CacheCoordinatorBuilder {
    display_name: String,
    base_dir: PathBuf,
    lock_target: Option<PathBuf>,
    options: LockOptions,
    settings: CacheSettings,
    manager: Option<FileLockManager>,
    initializer: Arc<dyn CacheInitializationAction>,
    cleanup: Option<Arc<dyn CacheCleanupExecutor>>,
    store_factory: Arc<dyn IndexedStoreFactory>,
    decorator_factory: Option<Arc<InMemoryCacheDecoratorFactory>>,
}

impl CacheCoordinatorBuilder {
    /// Coordinator for the cache directory `base_dir`, locked on demand
    pub fn new(display_name: &str, base_dir: &Path) -> Self {
        Self {
            display_name: display_name.to_string(),
            base_dir: base_dir.to_path_buf(),
            lock_target: None,
            options: LockOptions::mode(LockMode::OnDemand),
            settings: CacheSettings::default(),
            manager: None,
            initializer: Arc::new(NoOpInitialization),
            cleanup: None,
            store_factory: Arc::new(AppendLogStoreFactory),
            decorator_factory: None,
        }
    }

    /// Lock a different target than the cache directory
    pub fn lock_target(mut self, target: &Path) -> Self {
        self.lock_target = Some(target.to_path_buf());
        self
    }

    pub fn lock_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.options = self.options.with_mode(mode);
        self
    }

    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share a lock manager (and its locked-files registry) between coordinators
    pub fn lock_manager(mut self, manager: FileLockManager) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn initializer(mut self, initializer: Arc<dyn CacheInitializationAction>) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn cleanup(mut self, cleanup: Arc<dyn CacheCleanupExecutor>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn store_factory(mut self, factory: Arc<dyn IndexedStoreFactory>) -> Self {
        self.store_factory = factory;
        self
    }

    /// Share in-memory caches with other coordinators of this process
    pub fn decorator_factory(mut self, factory: Arc<InMemoryCacheDecoratorFactory>) -> Self {
        self.decorator_factory = Some(factory);
        self
    }

    pub fn build(self) -> CacheCoordinator {
        let manager = self
            .manager
            .unwrap_or_else(|| FileLockManager::standalone(&self.settings));
        let decorator_factory = self.decorator_factory.unwrap_or_else(|| {
            Arc::new(InMemoryCacheDecoratorFactory::from_settings(true, &self.settings))
        });
        let lock_target = self.lock_target.unwrap_or_else(|| self.base_dir.clone());

        let slot = Arc::new(LockSlot::new());
        let ownership = Arc::new(Ownership::new(&self.display_name));
        let registry = Arc::new(CacheRegistry::new(&self.display_name, slot.clone()));
        let observer = Arc::downgrade(&registry) as Weak<dyn LockObserver>;

        let file_access = match self.options.mode {
            LockMode::None => FileAccess::Transparent,
            _ => FileAccess::UnitOfWork {
                display_name: Arc::from(self.display_name.as_str()),
                ownership: ownership.clone(),
                slot: slot.clone(),
            },
        };
        let access = Arc::new(CacheAccess::for_mode(
            &self.display_name,
            &lock_target,
            self.options,
            manager,
            self.initializer,
            observer,
        ));

        CacheCoordinator {
            inner: Arc::new(CoordinatorInner {
                display_name: self.display_name,
                base_dir: self.base_dir,
                options: self.options,
                settings: self.settings,
                access,
                file_access,
                ownership,
                slot,
                registry,
                lifecycle: Mutex::new(Lifecycle::default()),
                worker: Mutex::new(None),
                cleanup: self.cleanup,
                store_factory: self.store_factory,
                decorator_factory,
            }),
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Debug, Default)]
struct Lifecycle {
    open: bool,
    already_cleaned: bool,
}

struct CoordinatorInner {
    display_name: String,
    base_dir: PathBuf,
    options: LockOptions,
    settings: CacheSettings,
    access: Arc<CacheAccess>,
    file_access: FileAccess,
    ownership: Arc<Ownership>,
    slot: Arc<LockSlot>,
    registry: Arc<CacheRegistry>,
    lifecycle: Mutex<Lifecycle>,
    worker: Mutex<Option<Arc<AsyncCacheAccessWorker>>>,
    cleanup: Option<Arc<dyn CacheCleanupExecutor>>,
    store_factory: Arc<dyn IndexedStoreFactory>,
    decorator_factory: Arc<InMemoryCacheDecoratorFactory>,
}

/// Ends a unit of work, also when the action panics
struct WorkGuard<'a> {
    ownership: &'a Ownership,
    started: bool,
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        if self.started {
            if let Some(releaser) = self.ownership.take_file_lock() {
                releaser.release();
            }
        }
        if let Err(e) = self.ownership.release() {
            warn!("{}", e);
        }
    }
}

impl CoordinatorInner {
    fn use_cache<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.ownership.take();
        let mut guard = WorkGuard {
            ownership: &self.ownership,
            started: false,
        };
        if !self.ownership.holds_file_lock() {
            let releaser = self.access.acquire_file_lock()?;
            self.ownership.set_file_lock(releaser);
            guard.started = true;
        }
        action()
    }

    fn with_ownership_now<T>(&self, action: impl FnOnce() -> T) -> Result<T> {
        self.ownership.take_now()?;
        let value = action();
        self.ownership.release()?;
        Ok(value)
    }

    fn run_cleanup(&self) {
        let Some(cleanup) = &self.cleanup else {
            return;
        };
        match cleanup.cleanup() {
            Ok(()) => self.lifecycle.lock().already_cleaned = true,
            Err(e) => warn!("Cache {} could not run cleanup action: {}", self.display_name, e),
        }
    }

    fn cache_file(&self, cache_name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.bin", cache_name))
    }
}

/// Gives the access worker exclusive use of a coordinator
struct CoordinatorHandle {
    display_name: String,
    inner: Weak<CoordinatorInner>,
}

impl ExclusiveAccess for CoordinatorHandle {
    fn use_cache_batch(&self, batch: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.use_cache(batch),
            None => Err(Error::AsyncWorker {
                cache: self.display_name.clone(),
                reason: "the cache coordinator has been dropped".to_string(),
            }),
        }
    }

    fn is_owned_by_current_thread(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.ownership.is_owned_by_current_thread())
    }
}

/// Owns in-process access to a cache directory
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("display_name", &self.inner.display_name)
            .field("mode", &self.inner.options.mode)
            .field("open", &self.is_open())
            .finish()
    }
}

impl CacheCoordinator {
    pub fn builder(display_name: &str, base_dir: &Path) -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder::new(display_name, base_dir)
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn lock_mode(&self) -> LockMode {
        self.inner.options.mode
    }

    pub fn is_open(&self) -> bool {
        self.inner.lifecycle.lock().open
    }

    /// Lock releases observed so far
    pub fn closed_count(&self) -> usize {
        self.inner.registry.closed_count()
    }

    /// Open the cache. Fails if it is already open.
    pub fn open(&self) -> Result<()> {
        let inner = &self.inner;
        inner.with_ownership_now(|| {
            let mut lifecycle = inner.lifecycle.lock();
            if lifecycle.open {
                return Err(Error::AlreadyOpen(inner.display_name.clone()));
            }
            if let Err(e) = inner.access.open() {
                inner.access.close();
                return Err(e);
            }
            lifecycle.open = true;
            debug!("Opened {} ({})", inner.display_name, inner.options.mode);
            Ok(())
        })?
    }

    /// Close the cache. Idempotent.
    ///
    /// A failure recorded by the access worker is returned after everything
    /// has been released.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let worker = inner.worker.lock().take();
        let worker_result = match worker {
            Some(worker) => worker.stop(),
            None => Ok(()),
        };

        inner.ownership.take_now()?;
        if let Some(releaser) = inner.ownership.take_file_lock() {
            releaser.release();
        }
        inner.access.close();
        let already_cleaned = inner.lifecycle.lock().already_cleaned;
        if inner.cleanup.is_some() && !already_cleaned {
            inner.run_cleanup();
        }
        let closed = inner.registry.closed_count();
        if closed != 1 {
            debug!("Cache {} was closed {} times.", inner.display_name, closed);
        }
        inner.lifecycle.lock().open = false;
        inner.ownership.reset();
        info!("Closed {}", inner.display_name);
        worker_result
    }

    /// Run cleanup now, after applying queued writes
    pub fn cleanup(&self) -> Result<()> {
        if self.inner.cleanup.is_none() {
            return Ok(());
        }
        let worker = self.inner.worker.lock().clone();
        if let Some(worker) = worker {
            worker.flush()?;
        }
        self.inner.with_ownership_now(|| self.inner.run_cleanup())
    }

    /// Run `action` as the single owner of the cache, holding the file lock.
    /// Nested calls from the owning thread join the outer unit of work.
    pub fn use_cache<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.inner.use_cache(action)
    }

    /// Run `action` holding the file lock, without taking ownership
    pub fn with_file_lock<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.inner.access.with_file_lock(action)
    }

    /// Whether the store file of a cache exists
    pub fn cache_exists<K: 'static, V: 'static>(&self, parameters: &IndexedCacheParameters<K, V>) -> bool {
        self.inner.cache_file(parameters.cache_name()).exists()
    }

    fn worker(&self) -> Result<Arc<AsyncCacheAccessWorker>> {
        let mut worker = self.inner.worker.lock();
        if let Some(existing) = worker.as_ref() {
            return Ok(existing.clone());
        }
        let handle: Arc<dyn ExclusiveAccess> = Arc::new(CoordinatorHandle {
            display_name: self.inner.display_name.clone(),
            inner: Arc::downgrade(&self.inner),
        });
        let created = Arc::new(AsyncCacheAccessWorker::spawn(
            &self.inner.display_name,
            handle,
            &self.inner.settings,
        )?);
        *worker = Some(created.clone());
        Ok(created)
    }

    /// Create or look up the cache named by `parameters`.
    ///
    /// Requesting a name again returns the same cache when the parameters
    /// agree and fails with [`Error::InvalidCacheReuse`] otherwise.
    pub fn new_cache<K: CacheKey, V: CacheValue>(
        &self,
        parameters: &IndexedCacheParameters<K, V>,
    ) -> Result<IndexedCache<K, V>> {
        let inner = &self.inner;
        let signature = parameters.signature();
        if let Some(existing) = lookup::<K, V>(&inner.registry.entries.lock(), &signature)? {
            return Ok(existing);
        }

        let name = parameters.cache_name();
        let cache_file = inner.cache_file(name);
        debug!(
            "Creating new cache for {}, path {}, access {}",
            name,
            cache_file.display(),
            inner.display_name
        );
        let persistent = Arc::new(PersistentIndexedCache::new(
            &cache_file,
            inner.store_factory.clone(),
            parameters.key_serializer().clone(),
            parameters.value_serializer().clone(),
            inner.file_access.clone(),
        ));
        let (cache, participant): (
            Arc<dyn MultiProcessSafeIndexedCache<K, V>>,
            Arc<dyn UnitOfWorkParticipant>,
        ) = match parameters.decorator() {
            Some(config) => {
                let decorated = inner.decorator_factory.decorate(
                    &cache_file.to_string_lossy(),
                    name,
                    persistent,
                    inner.access.clone(),
                    self.worker()?,
                    config,
                )?;
                if inner.slot.lock().is_none() {
                    // Empty unit of work so the lock state is known
                    self.use_cache(|| Ok(()))?;
                }
                (decorated.clone(), decorated)
            }
            None => (persistent.clone(), persistent),
        };

        let handle = IndexedCache::new(name, cache);
        {
            let mut entries = inner.registry.entries.lock();
            if let Some(existing) = lookup::<K, V>(&entries, &signature)? {
                return Ok(existing);
            }
            entries.push(CacheEntry {
                name: name.to_string(),
                signature,
                handle: Box::new(handle.clone()),
                participant: participant.clone(),
            });
        }
        if let Some(state) = inner.slot.state_at_open() {
            participant.after_lock_acquire(&state);
        }
        Ok(handle)
    }
}

fn lookup<K: CacheKey, V: CacheValue>(
    entries: &[CacheEntry],
    requested: &CacheSignature,
) -> Result<Option<IndexedCache<K, V>>> {
    let Some(entry) = entries.iter().find(|e| e.name == requested.cache_name()) else {
        return Ok(None);
    };
    let mut mismatches = entry.signature.mismatches(requested);
    let handle = entry.handle.downcast_ref::<IndexedCache<K, V>>();
    if handle.is_none() && mismatches.is_empty() {
        mismatches.push(format!(
            " * Requested key/value types ({}, {}) don't match current cache types",
            type_name::<K>(),
            type_name::<V>()
        ));
    }
    if !mismatches.is_empty() {
        return Err(Error::InvalidCacheReuse {
            cache_name: requested.cache_name().to_string(),
            mismatches,
        });
    }
    Ok(handle.cloned())
}

// =============================================================================
// Tests
// =============================================================================
