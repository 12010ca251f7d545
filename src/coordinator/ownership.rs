//! In-process ownership of a coordinator
//!
//! At most one thread owns a coordinator at a time. The owner may re-enter
//! freely; other threads block until the outermost call of the owner ends.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::access::Releaser;
use crate::error::{Error, Result};

#[derive(Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    depth: usize,
    /// File lock acquired on behalf of the current owner's unit of work
    file_lock_held_by_owner: Option<Releaser>,
}

/// Reentrant ownership token with a waiting room
pub struct Ownership {
    display_name: String,
    state: Mutex<OwnerState>,
    released: Condvar,
}

impl std::fmt::Debug for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Ownership")
            .field("owner", &state.owner)
            .field("depth", &state.depth)
            .finish()
    }
}

impl Ownership {
    pub fn new(display_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            state: Mutex::new(OwnerState::default()),
            released: Condvar::new(),
        }
    }

    /// Become the owner, waiting for another owner to finish
    pub fn take(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while matches!(state.owner, Some(owner) if owner != me) {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth += 1;
    }

    /// Become the owner without waiting
    pub fn take_now(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if matches!(state.owner, Some(owner) if owner != me) {
            return Err(Error::NotOwner(format!(
                "Cannot take ownership of {} as it is currently being used by another thread.",
                self.display_name
            )));
        }
        state.owner = Some(me);
        state.depth += 1;
        Ok(())
    }

    /// Leave one level; the last level wakes the waiting threads.
    /// Only the owner may release.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return Err(Error::NotOwner(format!(
                "Cannot release {} from a thread that does not own it (owner: {:?})",
                self.display_name, state.owner
            )));
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_all();
        }
        Ok(())
    }

    /// Whether the calling thread is the owner
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    /// Whether a unit of work of the owner already holds the file lock
    pub fn holds_file_lock(&self) -> bool {
        self.state.lock().file_lock_held_by_owner.is_some()
    }

    /// Remember the file lock acquired for the owner's unit of work
    pub fn set_file_lock(&self, releaser: Releaser) {
        self.state.lock().file_lock_held_by_owner = Some(releaser);
    }

    /// Hand back the owner's file lock releaser, if any
    pub fn take_file_lock(&self) -> Option<Releaser> {
        self.state.lock().file_lock_held_by_owner.take()
    }

    /// Drop ownership entirely, e.g. when the coordinator closes
    pub fn reset(&self) {
        let releaser = {
            let mut state = self.state.lock();
            state.owner = None;
            state.depth = 0;
            self.released.notify_all();
            state.file_lock_held_by_owner.take()
        };
        drop(releaser);
    }
}

// =============================================================================
// Tests
// =============================================================================
