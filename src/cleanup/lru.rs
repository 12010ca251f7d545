//! Least-recently-used cleanup of coarse-grained cache directories

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{
    delete_entry, CleanableStore, CleanupAction, CleanupProgressMonitor, Clock, FileAccessTimeJournal,
};
use crate::error::Result;

/// Deletes entries at a fixed depth below the cache directory that have not
/// been accessed within the retention period, then prunes directories left
/// empty.
pub struct LeastRecentlyUsedCacheCleanup {
    depth: usize,
    journal: Arc<dyn FileAccessTimeJournal>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl LeastRecentlyUsedCacheCleanup {
    /// `depth` 1 means the direct children of the cache directory
    pub fn new(
        depth: usize,
        journal: Arc<dyn FileAccessTimeJournal>,
        retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            depth: depth.max(1),
            journal,
            retention,
            clock,
        }
    }

    fn candidates(&self, store: &CleanableStore) -> Result<Vec<PathBuf>> {
        let mut level = vec![store.base_dir().to_path_buf()];
        for _ in 0..self.depth {
            let mut next = Vec::new();
            for dir in level {
                if !dir.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&dir)? {
                    let path = entry?.path();
                    if is_hidden(&path) || store.is_reserved(&path) {
                        continue;
                    }
                    next.push(path);
                }
            }
            level = next;
        }
        level.sort();
        Ok(level)
    }

    fn delete_empty_parents(&self, store: &CleanableStore, deleted: &[PathBuf]) {
        for path in deleted {
            let mut parent = path.parent();
            while let Some(dir) = parent {
                if dir == store.base_dir() || !dir.starts_with(store.base_dir()) {
                    break;
                }
                // Fails while the directory still has entries
                if fs::remove_dir(dir).is_err() {
                    break;
                }
                debug!("Deleted empty directory {}", dir.display());
                parent = dir.parent();
            }
        }
    }
}

impl CleanupAction for LeastRecentlyUsedCacheCleanup {
    fn clean(&self, store: &CleanableStore, monitor: &CleanupProgressMonitor) -> Result<()> {
        let now = self.clock.now();
        let mut deleted = Vec::new();
        for candidate in self.candidates(store)? {
            let last_access = self.journal.get_last_access_time(&candidate)?;
            let age = now.duration_since(last_access).unwrap_or(Duration::ZERO);
            if age <= self.retention {
                monitor.increment_skipped();
                continue;
            }
            match delete_entry(&candidate) {
                Ok(()) => {
                    debug!("Deleted unused cache entry {} (age {:?})", candidate.display(), age);
                    self.journal.delete_last_access_time(&candidate)?;
                    monitor.increment_deleted();
                    deleted.push(candidate);
                }
                Err(e) => {
                    warn!("Could not delete cache entry {}: {}", candidate.display(), e);
                    monitor.increment_skipped();
                }
            }
        }
        self.delete_empty_parents(store, &deleted);
        Ok(())
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}
