//! File Lock Manager
//!
//! Acquires cross-process locks on lock targets.
//!
//! # Design
//!
//! ```text
//! lock(target)
//!   │  registry.insert(canonical target)   ── AlreadyLocked if present
//!   │  contention.reserve_port()
//!   │  open <name>.lock
//!   ▼
//! ┌───────────────────────── retry with backoff ─────────────────────────┐
//! │ try lock state region (shared / exclusive)                           │
//! │   busy → read info region (shared) → ping holder's port if known     │
//! └──────────────────────────────────────────────────────────────────────┘
//!   │ acquired                           │ timer expired
//!   ▼                                    ▼
//! exclusive: ensure state,           LockTimeout { owner pid, operation }
//!            publish info region
//! shared:    read state
//! ```
//!
//! The returned [`FileLock`] holds the state region until [`FileLock::close`]
//! (or drop). Closing erases the published info before the state region is
//! released, so no owner claim outlives the OS lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::backoff::{Attempt, ExponentialBackoff};
use super::contention::{ContentionHandler, WhenContended, PING_DELAY};
use super::file_access::LockFileAccess;
use super::info::LockInfo;
use super::region::RegionLock;
use super::state::LockState;
use super::{lock_file_for, LockMode, LockOptions, PROCESS_ID};
use crate::config::CacheSettings;
use crate::error::{Error, Result};

/// Backoff bound for reading the info region of a busy lock
const INFO_READ_TIMEOUT: Duration = Duration::from_millis(100);

// =============================================================================
// Locked files registry
// =============================================================================

/// Process-scoped set of canonical targets currently locked by this process
#[derive(Debug, Default)]
pub struct LockedFiles {
    paths: DashSet<PathBuf>,
}

impl LockedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target; false if it is already locked
    pub fn insert(&self, target: PathBuf) -> bool {
        self.paths.insert(target)
    }

    pub fn remove(&self, target: &Path) {
        self.paths.remove(target);
    }

    pub fn contains(&self, target: &Path) -> bool {
        self.paths.contains(target)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Random positive lock id
fn new_lock_id() -> i64 {
    (uuid::Uuid::new_v4().as_u128() as i64) & i64::MAX
}

/// Canonical form of a target that may not exist yet
fn canonical_target(target: &Path) -> Result<PathBuf> {
    if target.exists() {
        return Ok(target.canonicalize()?);
    }
    match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            Ok(parent.canonicalize()?.join(name))
        }
        _ => Ok(std::env::current_dir()?.join(target)),
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Hands out [`FileLock`]s, sharing one registry and contention handler
#[derive(Clone)]
pub struct FileLockManager {
    registry: Arc<LockedFiles>,
    contention: Arc<ContentionHandler>,
    lock_timeout: Duration,
    short_timeout: Duration,
}

impl std::fmt::Debug for FileLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockManager")
            .field("locked", &self.registry.len())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl FileLockManager {
    /// Create a manager using the timeouts from `settings`
    pub fn new(
        registry: Arc<LockedFiles>,
        contention: Arc<ContentionHandler>,
        settings: &CacheSettings,
    ) -> Self {
        Self::with_timeouts(
            registry,
            contention,
            settings.lock_timeout(),
            settings.short_lock_timeout(),
        )
    }

    /// Create a manager with explicit timeouts
    pub fn with_timeouts(
        registry: Arc<LockedFiles>,
        contention: Arc<ContentionHandler>,
        lock_timeout: Duration,
        short_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            contention,
            lock_timeout,
            short_timeout,
        }
    }

    /// Standalone manager with its own registry and contention handler
    pub fn standalone(settings: &CacheSettings) -> Self {
        let contention = if settings.contention_pings {
            ContentionHandler::new()
        } else {
            ContentionHandler::disabled()
        };
        Self::new(Arc::new(LockedFiles::new()), Arc::new(contention), settings)
    }

    pub fn registry(&self) -> &Arc<LockedFiles> {
        &self.registry
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// A manager sharing this one's registry and contention handler but
    /// waiting at most `timeout` for a contended lock. A zero timeout makes
    /// a single attempt.
    pub fn with_lock_timeout(&self, timeout: Duration) -> Self {
        Self {
            lock_timeout: timeout,
            ..self.clone()
        }
    }

    /// Lock `target`, using the display name as operation description
    pub fn lock(&self, target: &Path, options: LockOptions, display_name: &str) -> Result<FileLock> {
        self.lock_with(target, options, display_name, display_name, None)
    }

    /// Lock `target`, reacting to contention with `when_contended`.
    ///
    /// `options.mode` must be [`LockMode::Shared`] or [`LockMode::Exclusive`].
    pub fn lock_with(
        &self,
        target: &Path,
        options: LockOptions,
        display_name: &str,
        operation: &str,
        when_contended: Option<WhenContended>,
    ) -> Result<FileLock> {
        let shared = match options.mode {
            LockMode::Shared => true,
            LockMode::Exclusive => false,
            other => {
                return Err(Error::IllegalLockState(format!(
                    "cannot acquire a {} lock on {}",
                    other, display_name
                )))
            }
        };

        let canonical = canonical_target(target)?;
        if !self.registry.insert(canonical.clone()) {
            return Err(Error::AlreadyLocked(display_name.to_string()));
        }

        match self.acquire(&canonical, options, shared, display_name, operation) {
            Ok(mut lock) => {
                if let Some(action) = when_contended {
                    self.contention.start(lock.lock_id, action);
                    lock.contention_registered = true;
                }
                Ok(lock)
            }
            Err(e) => {
                self.registry.remove(&canonical);
                Err(e)
            }
        }
    }

    fn acquire(
        &self,
        canonical: &Path,
        options: LockOptions,
        shared: bool,
        display_name: &str,
        operation: &str,
    ) -> Result<FileLock> {
        let port = self.contention.reserve_port();
        let lock_id = new_lock_id();
        let lock_file = lock_file_for(canonical);
        let access = LockFileAccess::open(&lock_file, options.protocol())?;

        debug!("Waiting to acquire {} lock on {}", options.mode, display_name);
        let started = Instant::now();
        let state_lock = self.lock_state_region(&access, shared, port, display_name, operation)?;

        let state = if shared {
            access.read_lock_state()
        } else {
            self.publish_holder(&access, port, lock_id, operation, display_name)
        };
        let state = match state {
            Ok(state) => state,
            Err(e) => {
                let _ = access.release(state_lock);
                return Err(e);
            }
        };
        debug!(
            "Lock acquired on {} in {:?} (sequence: {:?})",
            display_name,
            started.elapsed(),
            state.sequence()
        );

        Ok(FileLock {
            target: canonical.to_path_buf(),
            lock_file,
            display_name: display_name.to_string(),
            mode: options.mode,
            lock_id,
            registry: self.registry.clone(),
            contention: self.contention.clone(),
            short_timeout: self.short_timeout,
            contention_registered: false,
            inner: Mutex::new(Some(Held {
                access,
                state_lock,
                state,
            })),
        })
    }

    fn lock_state_region(
        &self,
        access: &LockFileAccess,
        shared: bool,
        port: i32,
        display_name: &str,
        operation: &str,
    ) -> Result<RegionLock> {
        let mut last_holder_port = -1;
        let mut last_ping: Option<Instant> = None;
        let mut backoff = ExponentialBackoff::new(self.lock_timeout);

        let outcome = backoff.retry_until(|backoff: &mut ExponentialBackoff| -> Result<Attempt<std::result::Result<RegionLock, LockInfo>>> {
            if let Some(lock) = access.try_lock_state(shared)? {
                return Ok(Attempt::Done(Ok(lock)));
            }
            let holder = read_holder(access);
            if port != -1 && holder.port != -1 {
                if holder.port != last_holder_port {
                    backoff.restart_timer();
                    last_holder_port = holder.port;
                    last_ping = None;
                }
                let since_last_ping = last_ping.map(|t| t.elapsed()).unwrap_or(PING_DELAY);
                let wake = backoff.signal().sender();
                if self.contention.maybe_ping_owner(
                    holder.port,
                    holder.lock_id,
                    display_name,
                    since_last_ping,
                    &wake,
                ) {
                    last_ping = Some(Instant::now());
                }
            }
            Ok(Attempt::Retry(Err(holder)))
        });
        self.contention.forget_waiter(&backoff.signal().sender());

        outcome?.map_err(|holder| Error::LockTimeout {
            display_name: display_name.to_string(),
            lock_file: access.path().to_path_buf(),
            owner_pid: holder.pid,
            owner_operation: holder.operation,
            our_pid: PROCESS_ID.clone(),
            our_operation: operation.to_string(),
        })
    }

    fn publish_holder(
        &self,
        access: &LockFileAccess,
        port: i32,
        lock_id: i64,
        operation: &str,
        display_name: &str,
    ) -> Result<LockState> {
        let state = access.ensure_lock_state()?;
        let info_lock = lock_info_region(access, false, self.short_timeout)?
            .ok_or_else(|| Error::InformationRegion(display_name.to_string()))?;
        let written = access.write_lock_info(&LockInfo {
            port,
            lock_id,
            pid: PROCESS_ID.clone(),
            operation: operation.to_string(),
        });
        access.release(info_lock)?;
        written?;
        Ok(state)
    }
}

fn lock_info_region(access: &LockFileAccess, shared: bool, timeout: Duration) -> Result<Option<RegionLock>> {
    let mut backoff = ExponentialBackoff::new(timeout);
    backoff.retry_until(|_: &mut ExponentialBackoff| -> Result<Attempt<Option<RegionLock>>> {
        Ok(match access.try_lock_info(shared)? {
            Some(lock) => Attempt::Done(Some(lock)),
            None => Attempt::Retry(None),
        })
    })
}

/// Best-effort read of the current holder's identity
fn read_holder(access: &LockFileAccess) -> LockInfo {
    let info_lock = match lock_info_region(access, true, INFO_READ_TIMEOUT) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            debug!("Could not lock information region for {}. Ignoring.", access.path().display());
            return LockInfo::default();
        }
        Err(e) => {
            debug!("Failed to lock information region for {}: {}", access.path().display(), e);
            return LockInfo::default();
        }
    };
    let info = access.read_lock_info().unwrap_or_else(|e| {
        debug!("Failed to read lock info from {}: {}", access.path().display(), e);
        LockInfo::default()
    });
    let _ = access.release(info_lock);
    info
}

// =============================================================================
// File lock
// =============================================================================

struct Held {
    access: LockFileAccess,
    state_lock: RegionLock,
    state: LockState,
}

/// A held cross-process lock on a target
pub struct FileLock {
    target: PathBuf,
    lock_file: PathBuf,
    display_name: String,
    mode: LockMode,
    lock_id: i64,
    registry: Arc<LockedFiles>,
    contention: Arc<ContentionHandler>,
    short_timeout: Duration,
    contention_registered: bool,
    inner: Mutex<Option<Held>>,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock")
            .field("target", &self.target)
            .field("mode", &self.mode)
            .field("open", &self.is_open())
            .finish()
    }
}

impl FileLock {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Mode the state region is held in
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    fn with_held<T>(&self, f: impl FnOnce(&mut Held) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        match inner.as_mut() {
            Some(held) => f(held),
            None => Err(Error::LockClosed(self.display_name.clone())),
        }
    }

    /// Current lock state
    pub fn state(&self) -> Result<LockState> {
        self.with_held(|held| Ok(held.state))
    }

    /// Whether the last writer completed its update
    pub fn unlocked_cleanly(&self) -> Result<bool> {
        self.with_held(|held| Ok(!held.state.is_dirty()))
    }

    /// Whether nothing was ever written through this lock file
    pub fn is_in_initial_state(&self) -> Result<bool> {
        self.with_held(|held| Ok(held.state.is_in_initial_state()))
    }

    fn assert_open_and_integral(&self) -> Result<()> {
        self.with_held(|held| {
            if held.state.is_dirty() {
                Err(Error::FileIntegrityViolation(self.target.clone()))
            } else {
                Ok(())
            }
        })
    }

    /// Run a read action, refusing if the last writer left the target dirty
    pub fn read_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.assert_open_and_integral()?;
        action()
    }

    /// Run a write action.
    ///
    /// The state is marked dirty first and only marked clean again when the
    /// action returns `Ok`; an error or panic leaves it dirty.
    pub fn write_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.mode != LockMode::Exclusive {
            self.with_held(|_| Ok(()))?;
            return Err(Error::InsufficientLockMode(self.display_name.clone()));
        }
        self.with_held(|held| {
            held.state = held.access.mark_dirty(&held.state)?;
            Ok(())
        })?;

        let value = action()?;

        self.with_held(|held| {
            held.state = held.access.mark_clean(&held.state)?;
            Ok(())
        })?;
        Ok(value)
    }

    /// Like [`FileLock::write_file`], but only on a clean target
    pub fn update_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.assert_open_and_integral()?;
        self.write_file(action)
    }

    /// Release the lock. Idempotent.
    pub fn close(&self) {
        let held = self.inner.lock().take();
        let Some(held) = held else {
            return;
        };
        debug!("Releasing lock on {}", self.display_name);

        if self.mode == LockMode::Exclusive {
            match lock_info_region(&held.access, false, self.short_timeout) {
                Ok(Some(info_lock)) => {
                    if let Err(e) = held.access.clear_lock_info() {
                        warn!("Failed to clear lock info of {}: {}", self.display_name, e);
                    }
                    let _ = held.access.release(info_lock);
                }
                Ok(None) => {
                    debug!("Could not lock information region for {}. Ignoring.", self.display_name);
                }
                Err(e) => {
                    debug!("Failed to lock information region for {}: {}", self.display_name, e);
                }
            }
        }
        if let Err(e) = held.access.release(held.state_lock) {
            debug!("Failed to release state region of {}: {}", self.display_name, e);
        }
        drop(held);

        if self.contention_registered {
            self.contention.stop(self.lock_id);
        }
        self.registry.remove(&self.target);
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Tests
// =============================================================================
