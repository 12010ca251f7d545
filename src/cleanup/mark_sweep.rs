//! Mark-and-sweep cleanup of fine-grained caches
//!
//! Entries are used concurrently by several processes, each entry guarded
//! by its own lock file, so an unused entry is never deleted in one step:
//!
//! ```text
//!   unused > retention          marker older than grace + hard delay
//!  ───────────────────► marked ──────────────────────────────────────► deleted
//!                         │                (under the entry's lock)
//!                         │ used again
//!                         ▼
//!                       live (marker removed by the cache)
//! ```
//!
//! Layout below the cache directory:
//!
//! ```text
//!   <key>                              entry (file or directory)
//!   locks/<key>.lock                   per-entry lock file
//!   .internal/gc/<key>/soft.deleted    epoch millis of the soft delete
//! ```

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use super::{
    delete_entry, from_millis, to_millis, CleanableStore, CleanupAction, CleanupProgressMonitor, Clock,
    FileAccessTimeJournal,
};
use crate::config::CacheSettings;
use crate::error::{Error, Result};
use crate::lock::{FileLockManager, LockMode, LockOptions};

pub const LOCKS_DIR: &str = "locks";
pub const GC_DIR: &str = ".internal/gc";
pub const SOFT_DELETED_MARKER: &str = "soft.deleted";

/// Target locked while `key` is in use
pub fn entry_lock_target(base_dir: &Path, key: &str) -> PathBuf {
    base_dir.join(LOCKS_DIR).join(key)
}

pub(crate) fn gc_dir_for(base_dir: &Path, key: &str) -> PathBuf {
    base_dir.join(GC_DIR).join(key)
}

pub fn soft_delete_marker(base_dir: &Path, key: &str) -> PathBuf {
    gc_dir_for(base_dir, key).join(SOFT_DELETED_MARKER)
}

/// When `key` was soft deleted, if it is
pub fn soft_deleted_at(base_dir: &Path, key: &str) -> Result<Option<SystemTime>> {
    let marker = soft_delete_marker(base_dir, key);
    let content = match fs::read_to_string(&marker) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match content.trim().parse::<u64>() {
        Ok(millis) => Ok(Some(from_millis(millis))),
        Err(_) => Ok(Some(fs::metadata(&marker)?.modified()?)),
    }
}

pub struct MarkAndSweepCleanup {
    manager: FileLockManager,
    journal: Arc<dyn FileAccessTimeJournal>,
    retention: Duration,
    grace: Duration,
    hard_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl MarkAndSweepCleanup {
    /// Entry locks are tried once; busy entries are left for the next pass
    pub fn new(
        manager: &FileLockManager,
        journal: Arc<dyn FileAccessTimeJournal>,
        retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            manager: manager.with_lock_timeout(Duration::ZERO),
            journal,
            retention,
            grace: Duration::from_secs(3600),
            hard_delay: Duration::ZERO,
            clock,
        }
    }

    pub fn from_settings(
        manager: &FileLockManager,
        journal: Arc<dyn FileAccessTimeJournal>,
        clock: Arc<dyn Clock>,
        settings: &CacheSettings,
    ) -> Self {
        Self::new(manager, journal, settings.lru_retention(), clock)
            .with_grace(settings.soft_delete_grace(), settings.hard_delete_delay())
    }

    pub fn with_grace(mut self, grace: Duration, hard_delay: Duration) -> Self {
        self.grace = grace;
        self.hard_delay = hard_delay;
        self
    }

    fn visit(
        &self,
        base: &Path,
        key: &str,
        entry: &Path,
        now: SystemTime,
        monitor: &CleanupProgressMonitor,
    ) -> Result<()> {
        match soft_deleted_at(base, key)? {
            Some(marked_at) if self.is_expired(marked_at, now) => self.sweep(base, key, entry, now, monitor),
            Some(_) => {
                monitor.increment_skipped();
                Ok(())
            }
            None => {
                let last_access = self.journal.get_last_access_time(entry)?;
                let unused = now.duration_since(last_access).unwrap_or(Duration::ZERO);
                if unused > self.retention {
                    let gc_dir = gc_dir_for(base, key);
                    fs::create_dir_all(&gc_dir)?;
                    fs::write(gc_dir.join(SOFT_DELETED_MARKER), to_millis(now).to_string())?;
                    debug!("Soft deleted cache entry {} (unused for {:?})", key, unused);
                }
                monitor.increment_skipped();
                Ok(())
            }
        }
    }

    fn is_expired(&self, marked_at: SystemTime, now: SystemTime) -> bool {
        now.duration_since(marked_at).unwrap_or(Duration::ZERO) >= self.grace + self.hard_delay
    }

    fn sweep(
        &self,
        base: &Path,
        key: &str,
        entry: &Path,
        now: SystemTime,
        monitor: &CleanupProgressMonitor,
    ) -> Result<()> {
        let options = LockOptions::mode(LockMode::Exclusive);
        let lock = match self.manager.lock(&entry_lock_target(base, key), options, key) {
            Ok(lock) => lock,
            Err(e) if e.is_lock_timeout() || matches!(e, Error::AlreadyLocked(_)) => {
                debug!("Cache entry {} is in use, not deleting it", key);
                monitor.increment_skipped();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // The entry may have been used since the marker was read
        let still_expired = soft_deleted_at(base, key)?.is_some_and(|at| self.is_expired(at, now));
        if !still_expired {
            lock.close();
            monitor.increment_skipped();
            return Ok(());
        }

        if let Err(e) = delete_entry(entry) {
            warn!("Could not delete cache entry {}: {}", entry.display(), e);
            lock.close();
            monitor.increment_skipped();
            return Ok(());
        }
        remove_quietly(&gc_dir_for(base, key));
        self.journal.delete_last_access_time(entry)?;
        if let Err(e) = fs::remove_file(lock.lock_file()) {
            if e.kind() != ErrorKind::NotFound {
                debug!("Could not remove lock file of {}: {}", key, e);
            }
        }
        lock.close();
        debug!("Deleted cache entry {}", key);
        monitor.increment_deleted();
        Ok(())
    }

    /// Remove gc metadata and lock files left behind by deleted entries
    fn remove_orphans(&self, base: &Path, live: &HashSet<String>) -> Result<()> {
        for (key, path) in children(&base.join(GC_DIR))? {
            if !live.contains(&key) {
                debug!("Removing orphaned gc metadata of {}", key);
                remove_quietly(&path);
            }
        }
        for (name, path) in children(&base.join(LOCKS_DIR))? {
            let Some(key) = name.strip_suffix(".lock") else {
                continue;
            };
            if live.contains(key) {
                continue;
            }
            self.remove_orphaned_lock(base, key, &path);
        }
        Ok(())
    }

    #[cfg(windows)]
    fn remove_orphaned_lock(&self, _base: &Path, key: &str, lock_file: &Path) {
        // Deleting fails while another handle is open, which is the check
        if fs::remove_file(lock_file).is_ok() {
            debug!("Removed orphaned lock file of {}", key);
        }
    }

    #[cfg(not(windows))]
    fn remove_orphaned_lock(&self, base: &Path, key: &str, lock_file: &Path) {
        let options = LockOptions::mode(LockMode::Exclusive);
        match self.manager.lock(&entry_lock_target(base, key), options, key) {
            Ok(lock) => {
                if !base.join(key).exists() && fs::remove_file(lock_file).is_ok() {
                    debug!("Removed orphaned lock file of {}", key);
                }
                lock.close();
            }
            Err(e) => debug!("Not removing lock file of {}: {}", key, e),
        }
    }
}

impl CleanupAction for MarkAndSweepCleanup {
    fn clean(&self, store: &CleanableStore, monitor: &CleanupProgressMonitor) -> Result<()> {
        let base = store.base_dir();
        let now = self.clock.now();
        let mut live = HashSet::new();
        for (key, path) in children(base)? {
            if key.starts_with('.') || key == LOCKS_DIR || store.is_reserved(&path) {
                continue;
            }
            self.visit(base, &key, &path, now, monitor)?;
            if path.exists() {
                live.insert(key);
            }
        }
        self.remove_orphans(base, &live)
    }
}

/// Sorted `(name, path)` of the entries of `dir`, empty when it is missing
fn children(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut children = Vec::new();
    for entry in entries {
        let entry = entry?;
        children.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    children.sort();
    Ok(children)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = delete_entry(path) {
        if e.kind() != ErrorKind::NotFound {
            debug!("Could not remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cleanup::{IndexedFileAccessTimeJournal, ManualClock};

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        _dir: tempfile::TempDir,
        base: PathBuf,
        clock: Arc<ManualClock>,
        journal: Arc<IndexedFileAccessTimeJournal>,
        manager: FileLockManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cache");
        fs::create_dir_all(&base).unwrap();
        let clock = Arc::new(ManualClock::new(from_millis(1_000_000)));
        let journal = Arc::new(
            IndexedFileAccessTimeJournal::open(&dir.path().join("journal.json"), clock.clone()).unwrap(),
        );
        let settings = CacheSettings {
            contention_pings: false,
            ..CacheSettings::default()
        };
        Fixture {
            _dir: dir,
            base,
            clock,
            journal,
            manager: FileLockManager::standalone(&settings),
        }
    }

    fn cleanup(f: &Fixture) -> MarkAndSweepCleanup {
        MarkAndSweepCleanup::new(&f.manager, f.journal.clone(), HOUR, f.clock.clone())
            .with_grace(HOUR, Duration::ZERO)
    }

    fn run(f: &Fixture) -> CleanupProgressMonitor {
        let monitor = CleanupProgressMonitor::new();
        cleanup(f)
            .clean(&CleanableStore::new("cache", &f.base), &monitor)
            .unwrap();
        monitor
    }

    #[test]
    fn test_entry_is_marked_before_deleted() {
        let f = fixture();
        fs::write(f.base.join("entry"), b"data").unwrap();
        f.clock.advance(HOUR * 2);

        run(&f);
        assert!(f.base.join("entry").exists());
        assert!(soft_deleted_at(&f.base, "entry").unwrap().is_some());

        f.clock.advance(HOUR / 2);
        run(&f);
        assert!(f.base.join("entry").exists());

        f.clock.advance(HOUR);
        let monitor = run(&f);
        assert!(!f.base.join("entry").exists());
        assert!(!gc_dir_for(&f.base, "entry").exists());
        assert!(!f.base.join(LOCKS_DIR).join("entry.lock").exists());
        assert_eq!(monitor.deleted(), 1);
    }

    #[test]
    fn test_locked_entry_is_skipped() {
        let f = fixture();
        fs::write(f.base.join("entry"), b"data").unwrap();
        f.clock.advance(HOUR * 2);
        run(&f);
        f.clock.advance(HOUR * 2);

        let holder = f
            .manager
            .lock(
                &entry_lock_target(&f.base, "entry"),
                LockOptions::mode(LockMode::Exclusive),
                "entry",
            )
            .unwrap();
        let monitor = run(&f);
        assert!(f.base.join("entry").exists());
        assert_eq!(monitor.deleted(), 0);
        holder.close();

        run(&f);
        assert!(!f.base.join("entry").exists());
    }

    #[test]
    fn test_orphans_are_removed() {
        let f = fixture();
        fs::create_dir_all(gc_dir_for(&f.base, "gone")).unwrap();
        fs::create_dir_all(f.base.join(LOCKS_DIR)).unwrap();
        fs::write(f.base.join(LOCKS_DIR).join("gone.lock"), b"").unwrap();
        fs::write(f.base.join("kept"), b"x").unwrap();
        fs::write(f.base.join(LOCKS_DIR).join("kept.lock"), b"").unwrap();

        run(&f);
        assert!(!gc_dir_for(&f.base, "gone").exists());
        assert!(!f.base.join(LOCKS_DIR).join("gone.lock").exists());
        assert!(f.base.join(LOCKS_DIR).join("kept.lock").exists());
    }
}
