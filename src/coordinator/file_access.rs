//! File access used by persistent caches of a coordinator

use std::sync::Arc;

use parking_lot::Mutex;

use super::ownership::Ownership;
use crate::error::{Error, Result};
use crate::lock::{FileLock, LockState};

/// The file lock currently held by a coordinator, with its state at acquire
#[derive(Default)]
pub struct LockSlot {
    current: Mutex<Option<(Arc<FileLock>, LockState)>>,
}

impl LockSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, lock: Arc<FileLock>, state: LockState) {
        *self.current.lock() = Some((lock, state));
    }

    pub fn clear(&self) {
        self.current.lock().take();
    }

    pub fn lock(&self) -> Option<Arc<FileLock>> {
        self.current.lock().as_ref().map(|(lock, _)| lock.clone())
    }

    /// State observed when the current lock was acquired
    pub fn state_at_open(&self) -> Option<LockState> {
        self.current.lock().as_ref().map(|(_, state)| *state)
    }
}

/// How a persistent cache reaches its files
#[derive(Clone)]
pub enum FileAccess {
    /// No locking; actions run directly
    Transparent,
    /// Actions run through the file lock of the owner's unit of work
    UnitOfWork {
        display_name: Arc<str>,
        ownership: Arc<Ownership>,
        slot: Arc<LockSlot>,
    },
}

impl std::fmt::Debug for FileAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAccess::Transparent => write!(f, "Transparent"),
            FileAccess::UnitOfWork { display_name, .. } => write!(f, "UnitOfWork({})", display_name),
        }
    }
}

impl FileAccess {
    fn file_lock(&self) -> Result<Option<Arc<FileLock>>> {
        match self {
            FileAccess::Transparent => Ok(None),
            FileAccess::UnitOfWork {
                display_name,
                ownership,
                slot,
            } => {
                let lock = slot.lock();
                if !ownership.is_owned_by_current_thread() {
                    return Err(Error::NotOwner(format!(
                        "The {} has not been locked for this thread. File lock: {}, owner: {:?}",
                        display_name,
                        lock.is_some(),
                        ownership.owner()
                    )));
                }
                match lock {
                    Some(lock) => Ok(Some(lock)),
                    None => Err(Error::IllegalLockState(format!(
                        "no file lock is held for {}",
                        display_name
                    ))),
                }
            }
        }
    }

    /// Run a read; fails if the last writer did not finish cleanly
    pub fn read_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        match self.file_lock()? {
            Some(lock) => lock.read_file(action),
            None => action(),
        }
    }

    /// Run a write on a clean cache
    pub fn update_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        match self.file_lock()? {
            Some(lock) => lock.update_file(action),
            None => action(),
        }
    }

    /// Run a write, marking the lock dirty until it completes
    pub fn write_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        match self.file_lock()? {
            Some(lock) => lock.write_file(action),
            None => action(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_transparent_runs_directly() {
        let access = FileAccess::Transparent;
        assert_eq!(access.read_file(|| Ok(1)).unwrap(), 1);
        assert_eq!(access.write_file(|| Ok(2)).unwrap(), 2);
        assert_eq!(access.update_file(|| Ok(3)).unwrap(), 3);
    }

    #[test]
    fn test_unit_of_work_requires_ownership() {
        let ownership = Arc::new(Ownership::new("cache"));
        let access = FileAccess::UnitOfWork {
            display_name: Arc::from("cache"),
            ownership: ownership.clone(),
            slot: Arc::new(LockSlot::new()),
        };
        assert_matches!(access.read_file(|| Ok(())), Err(Error::NotOwner(_)));

        ownership.take();
        assert_matches!(access.read_file(|| Ok(())), Err(Error::IllegalLockState(_)));
        ownership.release().unwrap();
    }
}
