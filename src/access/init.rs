//! Cache initialization actions
//!
//! Run by the access strategies right after the file lock is acquired, to
//! decide whether the cache content can be trusted and rebuild it if not.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::lock::FileLock;

/// Name of the declared-properties file inside a cache directory
pub const CACHE_PROPERTIES_FILE: &str = "cache.properties";

/// Decides whether a freshly locked cache must be (re)built
pub trait CacheInitializationAction: Send + Sync {
    fn requires_initialization(&self, lock: &FileLock) -> Result<bool>;

    /// Rebuild the cache. Runs inside a write on an exclusive lock.
    fn initialize(&self, lock: &FileLock) -> Result<()>;
}

/// Never initializes anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpInitialization;

impl CacheInitializationAction for NoOpInitialization {
    fn requires_initialization(&self, _lock: &FileLock) -> Result<bool> {
        Ok(false)
    }

    fn initialize(&self, _lock: &FileLock) -> Result<()> {
        Ok(())
    }
}

/// Rebuilds the cache whenever the previous writer did not finish cleanly
pub struct RebuildOnDirtyInitialization {
    rebuild: Box<dyn Fn(&FileLock) -> Result<()> + Send + Sync>,
}

impl RebuildOnDirtyInitialization {
    pub fn new(rebuild: impl Fn(&FileLock) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            rebuild: Box::new(rebuild),
        }
    }
}

impl CacheInitializationAction for RebuildOnDirtyInitialization {
    fn requires_initialization(&self, lock: &FileLock) -> Result<bool> {
        Ok(!lock.unlocked_cleanly()?)
    }

    fn initialize(&self, lock: &FileLock) -> Result<()> {
        info!("Rebuilding {}", lock.display_name());
        (self.rebuild)(lock)
    }
}

/// Requires initialization when `cache.properties` is missing or differs
/// from the declared properties, then writes them after `inner` ran
pub struct PropertiesInitialization {
    properties_file: PathBuf,
    properties: BTreeMap<String, String>,
    inner: Arc<dyn CacheInitializationAction>,
}

impl PropertiesInitialization {
    pub fn new(
        cache_dir: &Path,
        properties: BTreeMap<String, String>,
        inner: Arc<dyn CacheInitializationAction>,
    ) -> Self {
        Self {
            properties_file: cache_dir.join(CACHE_PROPERTIES_FILE),
            properties,
            inner,
        }
    }

    fn stored(&self) -> Result<Option<BTreeMap<String, String>>> {
        if !self.properties_file.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.properties_file)?;
        Ok(Some(parse_properties(&content)))
    }
}

impl CacheInitializationAction for PropertiesInitialization {
    fn requires_initialization(&self, lock: &FileLock) -> Result<bool> {
        if self.inner.requires_initialization(lock)? {
            return Ok(true);
        }
        if self.properties.is_empty() {
            return Ok(false);
        }
        Ok(self.stored()?.as_ref() != Some(&self.properties))
    }

    fn initialize(&self, lock: &FileLock) -> Result<()> {
        self.inner.initialize(lock)?;
        if let Some(parent) = self.properties_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.properties_file, format_properties(&self.properties))?;
        Ok(())
    }
}

/// Parse `key=value` lines, ignoring blanks and `#` comments
pub fn parse_properties(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn format_properties(properties: &BTreeMap<String, String>) -> String {
    properties
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
