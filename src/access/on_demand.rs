//! On-demand access: the exclusive lock is taken lazily and given up when
//! another process asks for it while this one is idle
//!
//! ```text
//!   refs 0 ──acquire──▶ refs 1..n ──release──▶ refs 0
//!   (lock on 0→1)                               │
//!                                               ├─ contended while busy → release now
//!                                               └─ otherwise keep lock warm
//!   contention ping while refs 0 → release immediately, confirm to requester
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

use super::{
    initialize_if_required, notify_acquire, notify_release, CacheInitializationAction,
    CrossProcessCacheAccess, LockObserver, Releaser,
};
use crate::error::Result;
use crate::lock::{FileLock, FileLockManager, LockOptions, ReleaseSignal, WhenContended};

#[derive(Default)]
struct OnDemandState {
    lock_count: usize,
    lock: Option<Arc<FileLock>>,
    pending_release: Option<ReleaseSignal>,
}

struct Shared {
    display_name: String,
    target: PathBuf,
    options: LockOptions,
    manager: FileLockManager,
    initializer: Arc<dyn CacheInitializationAction>,
    observer: Weak<dyn LockObserver>,
    state: Mutex<OnDemandState>,
}

impl Shared {
    fn release_lock_if_held(&self, state: &mut OnDemandState) {
        if let Some(lock) = state.lock.take() {
            notify_release(&self.observer, &lock);
            lock.close();
        }
    }

    fn increment(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.lock_count == 0 && state.lock.is_none() {
            let weak = Arc::downgrade(self);
            let when_contended: WhenContended = Arc::new(move |signal: ReleaseSignal| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_contended(signal);
                }
            });
            let lock = Arc::new(self.manager.lock_with(
                &self.target,
                self.options,
                &self.display_name,
                "",
                Some(when_contended),
            )?);
            initialize_if_required(self.initializer.as_ref(), &lock)?;
            notify_acquire(&self.observer, &lock);
            state.lock = Some(lock);
        }
        state.lock_count += 1;
        Ok(())
    }

    fn decrement(&self) {
        let mut state = self.state.lock();
        if state.lock_count == 0 || state.lock.is_none() {
            error!("Mismatched lock count for {}", self.display_name);
            return;
        }
        state.lock_count -= 1;
        if state.lock_count == 0 {
            if let Some(signal) = state.pending_release.take() {
                debug!("Releasing contended lock on {}", self.display_name);
                self.release_lock_if_held(&mut state);
                signal.trigger();
            }
        }
    }

    fn on_contended(&self, signal: ReleaseSignal) {
        let mut state = self.state.lock();
        if state.lock_count == 0 {
            debug!(
                "Lock on {} requested by another process - releasing lock.",
                self.display_name
            );
            self.release_lock_if_held(&mut state);
            signal.trigger();
        } else {
            debug!(
                "Lock on {} requested by another process - will release when operation completes.",
                self.display_name
            );
            state.pending_release = Some(signal);
        }
    }
}

/// Exclusive lock acquired on first use and released on contention
pub struct OnDemandCacheAccess {
    shared: Arc<Shared>,
}

impl OnDemandCacheAccess {
    pub fn new(
        display_name: &str,
        target: &Path,
        options: LockOptions,
        manager: FileLockManager,
        initializer: Arc<dyn CacheInitializationAction>,
        observer: Weak<dyn LockObserver>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                display_name: display_name.to_string(),
                target: target.to_path_buf(),
                options,
                manager,
                initializer,
                observer,
                state: Mutex::new(OnDemandState::default()),
            }),
        }
    }

    /// Whether the OS lock is currently held
    pub fn is_locked(&self) -> bool {
        self.shared.state.lock().lock.is_some()
    }

    /// Number of outstanding acquisitions
    pub fn lock_count(&self) -> usize {
        self.shared.state.lock().lock_count
    }
}

impl CrossProcessCacheAccess for OnDemandCacheAccess {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.lock_count != 0 {
            error!(
                "Closing cache access for {} while it is in use by {} operations",
                self.shared.display_name, state.lock_count
            );
            state.lock_count = 0;
        }
        self.shared.release_lock_if_held(&mut state);
        if let Some(signal) = state.pending_release.take() {
            signal.trigger();
        }
    }

    fn acquire_file_lock(&self) -> Result<Releaser> {
        self.shared.increment()?;
        let shared = self.shared.clone();
        Ok(Releaser::new(move || shared.decrement()))
    }
}

impl Drop for OnDemandCacheAccess {
    fn drop(&mut self) {
        if self.is_locked() {
            self.close();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
