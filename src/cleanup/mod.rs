//! Cache Cleanup
//!
//! Keeps cache directories bounded. Cleanup is best-effort: a failing pass
//! is logged and never fails the operation that triggered it.
//!
//! # Design
//!
//! ```text
//!  CacheCoordinator::close() / cleanup()       cachectl cleanup|sweep|prune
//!                 │                                        │
//!                 ▼                                        │
//!  DefaultCacheCleanupExecutor                             │
//!    gc.properties mtime + CleanupFrequency ──► skip       │
//!                 │ due                                    │
//!                 ▼                                        ▼
//!           CleanupAction ◄───────────────────────────────-┘
//!     ┌──────────────┼──────────────────┬─────────────────────┐
//!     ▼              ▼                  ▼                     ▼
//!  LeastRecently  MarkAndSweep     UnusedVersions      CompositeCleanup
//!  UsedCleanup    Cleanup          Cleanup             Action
//!     │              │
//!     └──────┬───────┘
//!            ▼
//!   FileAccessTimeJournal (indexed JSON file | file mtime)
//! ```
//!
//! Time is read through a [`Clock`] so grace periods and retention can be
//! driven by a [`ManualClock`] in tests.

mod journal;
mod lru;
mod mark_sweep;
mod versions;

pub use journal::{
    FileAccessTimeJournal, IndexedFileAccessTimeJournal, ModificationTimeFileAccessTimeJournal,
};
pub use self::lru::LeastRecentlyUsedCacheCleanup;
pub use mark_sweep::{
    entry_lock_target, soft_delete_marker, soft_deleted_at, MarkAndSweepCleanup, GC_DIR, LOCKS_DIR,
    SOFT_DELETED_MARKER,
};
pub use versions::{CacheVersion, UnusedVersionsCacheCleanup};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Marker file whose modification time records the last full cleanup
pub const GC_PROPERTIES_FILE: &str = "gc.properties";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Policy
// =============================================================================

/// How often a cache may be cleaned up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupFrequency {
    /// At most once per 24 hours
    Daily,
    /// Every time cleanup is requested
    Always,
    /// Cleanup disabled
    Never,
    /// At most once per interval
    Every(Duration),
}

impl CleanupFrequency {
    /// Whether a cleanup last run at `last` is due again at `now`
    pub fn should_cleanup(&self, last: SystemTime, now: SystemTime) -> bool {
        let elapsed = now.duration_since(last).unwrap_or(Duration::ZERO);
        match self {
            CleanupFrequency::Daily => elapsed > DAY,
            CleanupFrequency::Always => true,
            CleanupFrequency::Never => false,
            CleanupFrequency::Every(interval) => elapsed >= *interval,
        }
    }
}

// =============================================================================
// Clock
// =============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

pub(crate) fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn from_millis(millis: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
}

// =============================================================================
// Store & progress
// =============================================================================

/// A cache directory as seen by cleanup
#[derive(Debug, Clone)]
pub struct CleanableStore {
    display_name: String,
    base_dir: PathBuf,
    reserved_files: Vec<PathBuf>,
}

impl CleanableStore {
    /// `gc.properties` and `cache.properties` are always reserved
    pub fn new(display_name: &str, base_dir: &Path) -> Self {
        Self {
            display_name: display_name.to_string(),
            base_dir: base_dir.to_path_buf(),
            reserved_files: vec![
                base_dir.join(GC_PROPERTIES_FILE),
                base_dir.join(crate::access::CACHE_PROPERTIES_FILE),
            ],
        }
    }

    /// Never delete `file`, e.g. the lock file of the store
    pub fn reserve(mut self, file: &Path) -> Self {
        self.reserved_files.push(file.to_path_buf());
        self
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn is_reserved(&self, file: &Path) -> bool {
        self.reserved_files.iter().any(|reserved| reserved == file)
            || file
                .extension()
                .is_some_and(|ext| ext == "lock")
    }

    pub fn gc_file(&self) -> PathBuf {
        self.base_dir.join(GC_PROPERTIES_FILE)
    }
}

/// Counts what a cleanup pass did
#[derive(Debug, Default)]
pub struct CleanupProgressMonitor {
    deleted: AtomicU64,
    skipped: AtomicU64,
}

impl CleanupProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// One cleanup strategy
pub trait CleanupAction: Send + Sync {
    fn clean(&self, store: &CleanableStore, monitor: &CleanupProgressMonitor) -> Result<()>;
}

/// Runs several actions in order, stopping at the first failure
#[derive(Default)]
pub struct CompositeCleanupAction {
    actions: Vec<Arc<dyn CleanupAction>>,
}

impl CompositeCleanupAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, action: Arc<dyn CleanupAction>) -> Self {
        self.actions.push(action);
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl CleanupAction for CompositeCleanupAction {
    fn clean(&self, store: &CleanableStore, monitor: &CleanupProgressMonitor) -> Result<()> {
        for action in &self.actions {
            action.clean(store, monitor)?;
        }
        Ok(())
    }
}

// =============================================================================
// Reporting
// =============================================================================

/// Outcome of a cleanup pass
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub store: String,
    pub deleted: u64,
    pub skipped: u64,
    pub previous_cleanup: Option<DateTime<Utc>>,
    pub duration: Duration,
}

/// Sink for cleanup outcomes
pub trait CleanupReporter: Send + Sync {
    fn report(&self, report: &CleanupReport);
}

/// Logs reports at `info`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingCleanupReporter;

impl CleanupReporter for TracingCleanupReporter {
    fn report(&self, report: &CleanupReport) {
        info!(
            store = %report.store,
            deleted = report.deleted,
            skipped = report.skipped,
            previous_cleanup = ?report.previous_cleanup,
            "{} cleaned up in {:?}",
            report.store,
            report.duration
        );
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Invoked by a coordinator to clean its cache directory
pub trait CacheCleanupExecutor: Send + Sync {
    fn cleanup(&self) -> Result<()>;
}

/// Runs a [`CleanupAction`] when `gc.properties` says one is due
pub struct DefaultCacheCleanupExecutor {
    store: CleanableStore,
    action: Arc<dyn CleanupAction>,
    frequency: CleanupFrequency,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn CleanupReporter>,
}

impl DefaultCacheCleanupExecutor {
    pub fn new(store: CleanableStore, action: Arc<dyn CleanupAction>, frequency: CleanupFrequency) -> Self {
        Self {
            store,
            action,
            frequency,
            clock: Arc::new(SystemClock),
            reporter: Arc::new(TracingCleanupReporter),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn CleanupReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Time of the last completed cleanup, `None` if never cleaned
    pub fn last_cleanup_time(&self) -> Option<SystemTime> {
        fs::metadata(self.store.gc_file())
            .and_then(|meta| meta.modified())
            .ok()
    }

    fn mark_cleaned(&self, at: SystemTime) -> Result<()> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.store.gc_file())?;
        file.set_modified(at)?;
        Ok(())
    }

    fn perform_cleanup(&self, previous: SystemTime) -> Result<()> {
        let started = Instant::now();
        let monitor = CleanupProgressMonitor::new();
        self.action
            .clean(&self.store, &monitor)
            .map_err(|e| Error::Cleanup {
                store: self.store.display_name().to_string(),
                reason: e.to_string(),
            })?;
        self.mark_cleaned(self.clock.now())?;
        self.reporter.report(&CleanupReport {
            store: self.store.display_name().to_string(),
            deleted: monitor.deleted(),
            skipped: monitor.skipped(),
            previous_cleanup: Some(DateTime::<Utc>::from(previous)),
            duration: started.elapsed(),
        });
        Ok(())
    }
}

impl CacheCleanupExecutor for DefaultCacheCleanupExecutor {
    fn cleanup(&self) -> Result<()> {
        if self.frequency == CleanupFrequency::Never {
            debug!("Cleanup of {} is disabled", self.store.display_name());
            return Ok(());
        }
        let now = self.clock.now();
        let Some(previous) = self.last_cleanup_time() else {
            // First sighting counts as a cleanup
            if let Err(e) = self.mark_cleaned(now) {
                warn!("Could not create {}: {}", self.store.gc_file().display(), e);
            }
            return Ok(());
        };
        if !self.frequency.should_cleanup(previous, now) {
            debug!("Skipping cleanup of {} as it is not yet due", self.store.display_name());
            return Ok(());
        }
        if let Err(e) = self.perform_cleanup(previous) {
            warn!("{}", e);
        }
        Ok(())
    }
}

/// Delete a file or directory tree
pub(crate) fn delete_entry(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

// =============================================================================
// Tests
// =============================================================================
