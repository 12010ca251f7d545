//! Registered caches and the lock notifications fanned out to them

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::file_access::LockSlot;
use super::params::CacheSignature;
use crate::access::LockObserver;
use crate::indexed::UnitOfWorkParticipant;
use crate::lock::FileLock;

pub(crate) struct CacheEntry {
    pub(crate) name: String,
    pub(crate) signature: CacheSignature,
    /// The `IndexedCache<K, V>` handed out for this name
    pub(crate) handle: Box<dyn Any + Send + Sync>,
    pub(crate) participant: Arc<dyn UnitOfWorkParticipant>,
}

/// Caches of one coordinator, notified in registration order whenever the
/// coordinator's file lock is acquired or about to be released
pub struct CacheRegistry {
    display_name: String,
    slot: Arc<LockSlot>,
    pub(crate) entries: Mutex<Vec<CacheEntry>>,
    closed_count: AtomicUsize,
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("display_name", &self.display_name)
            .field("caches", &self.entries.lock().len())
            .field("closed_count", &self.closed_count())
            .finish()
    }
}

impl CacheRegistry {
    pub fn new(display_name: &str, slot: Arc<LockSlot>) -> Self {
        Self {
            display_name: display_name.to_string(),
            slot,
            entries: Mutex::new(Vec::new()),
            closed_count: AtomicUsize::new(0),
        }
    }

    /// How often the file lock was released
    pub fn closed_count(&self) -> usize {
        self.closed_count.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn participants(&self) -> Vec<Arc<dyn UnitOfWorkParticipant>> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.participant.clone())
            .collect()
    }
}

impl LockObserver for CacheRegistry {
    fn after_lock_acquire(&self, lock: &Arc<FileLock>) {
        let state = match lock.state() {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not read lock state of {}: {}", self.display_name, e);
                return;
            }
        };
        debug!("Acquired file lock of {} ({:?})", self.display_name, state.sequence());
        self.slot.set(lock.clone(), state);
        for participant in self.participants() {
            participant.after_lock_acquire(&state);
        }
    }

    fn before_lock_release(&self, lock: &Arc<FileLock>) {
        self.closed_count.fetch_add(1, Ordering::SeqCst);
        self.finish_work();
        match lock.state() {
            Ok(state) => {
                for participant in self.participants() {
                    participant.before_lock_release(&state);
                }
            }
            Err(e) => warn!("Could not read lock state of {}: {}", self.display_name, e),
        }
        self.slot.clear();
    }

    fn finish_work(&self) {
        for participant in self.participants() {
            participant.finish_work();
        }
    }
}
