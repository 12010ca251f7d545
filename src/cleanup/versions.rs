//! Pruning of cache directories left behind by older cache layouts

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{delete_entry, CleanableStore, CleanupAction, CleanupProgressMonitor};
use crate::error::{Error, Result};

/// Dotted numeric version embedded in a cache directory name, e.g. `3` or `8.1`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheVersion(Vec<u32>);

impl CacheVersion {
    pub fn new(parts: impl Into<Vec<u32>>) -> Self {
        Self(parts.into())
    }

    pub fn parts(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for CacheVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::Config(format!("invalid cache version '{}'", s)))?;
        Ok(Self(parts))
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl Ord for CacheVersion {
    /// Missing trailing parts count as zero, so `2` equals `2.0`
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for CacheVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CacheVersion {}

impl PartialOrd for CacheVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deletes `<prefix><version>` directories next to the current one whose
/// version is older than the current version and not still in use.
///
/// The store given to [`CleanupAction::clean`] is the parent directory
/// holding the versioned cache directories.
#[derive(Debug, Clone)]
pub struct UnusedVersionsCacheCleanup {
    prefix: String,
    current: CacheVersion,
    in_use: Vec<CacheVersion>,
}

impl UnusedVersionsCacheCleanup {
    pub fn new(prefix: &str, current: CacheVersion) -> Self {
        Self {
            prefix: prefix.to_string(),
            current,
            in_use: Vec::new(),
        }
    }

    /// Keep directories of versions another installation still uses
    pub fn in_use(mut self, versions: impl IntoIterator<Item = CacheVersion>) -> Self {
        self.in_use.extend(versions);
        self
    }

    fn is_unused(&self, version: &CacheVersion) -> bool {
        *version < self.current && !self.in_use.iter().any(|v| v == version)
    }
}

impl CleanupAction for UnusedVersionsCacheCleanup {
    fn clean(&self, store: &CleanableStore, monitor: &CleanupProgressMonitor) -> Result<()> {
        for entry in fs::read_dir(store.base_dir())? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(version) = name
                .strip_prefix(self.prefix.as_str())
                .and_then(|suffix| suffix.parse::<CacheVersion>().ok())
            else {
                continue;
            };
            if !self.is_unused(&version) {
                debug!("Keeping cache directory {} (version {})", name, version);
                monitor.increment_skipped();
                continue;
            }
            match delete_entry(&path) {
                Ok(()) => {
                    info!("Deleted unused cache directory {}", path.display());
                    monitor.increment_deleted();
                }
                Err(e) => {
                    warn!("Could not delete unused cache directory {}: {}", path.display(), e);
                    monitor.increment_skipped();
                }
            }
        }
        Ok(())
    }
}
