//! Cache Settings
//!
//! Tunables shared by the lock manager, coordinators, async workers and
//! cleanup engines. Settings can be loaded from a YAML file; a couple of
//! process-level knobs may be overridden from the environment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cleanup::CleanupFrequency;
use crate::error::{Error, Result};

/// Environment variable holding the assumed reserved heap, in megabytes
pub const RESERVED_MB_ENV: &str = "PERSISTENT_CACHE_RESERVED_MB";

/// Environment variable overriding the lock timeout, in milliseconds
pub const LOCK_TIMEOUT_ENV: &str = "PERSISTENT_CACHE_LOCK_TIMEOUT_MS";

/// Default time to wait for a contended lock (60s)
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 60_000;

/// Settings for a persistent cache deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum wait for the state region of a lock file
    pub lock_timeout_ms: u64,
    /// Maximum wait for the info region of a lock file
    pub short_lock_timeout_ms: u64,
    /// Use the single-byte lock state protocol readable by older clients
    pub use_cross_version_lock_protocol: bool,
    /// Whether to listen for and send contention pings
    pub contention_pings: bool,
    /// How often cleanup may run
    pub cleanup_frequency: CleanupFrequency,
    /// Entries not accessed for this many days are removed by LRU cleanup
    pub lru_retention_days: u64,
    /// Minimum age of a soft-delete marker before the entry can be swept
    pub soft_delete_grace_secs: u64,
    /// Additional delay on top of the soft-delete grace
    pub hard_delete_delay_secs: u64,
    /// Reference number of in-memory entries per decorated cache
    pub in_memory_max_entries: usize,
    /// Memory budget the in-memory sizes are scaled against
    pub memory_budget_mb: u64,
    /// Upper bound for the async worker queue capacity
    pub async_queue_capacity_cap: usize,
    /// Time the async worker keeps draining after the last item
    pub batch_window_ms: u64,
    /// Maximum time the async worker holds the lock for one batch
    pub max_locking_time_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            short_lock_timeout_ms: 10_000,
            use_cross_version_lock_protocol: false,
            contention_pings: true,
            cleanup_frequency: CleanupFrequency::Daily,
            lru_retention_days: 30,
            soft_delete_grace_secs: 3600,
            hard_delete_delay_secs: 0,
            in_memory_max_entries: 10_000,
            memory_budget_mb: 910,
            async_queue_capacity_cap: 4000,
            batch_window_ms: 200,
            max_locking_time_ms: 5000,
        }
    }
}

impl CacheSettings {
    /// Load settings from a YAML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: CacheSettings = serde_yaml::from_str(&content)?;
        settings.with_env_overrides()
    }

    /// Apply environment overrides on top of these settings
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(raw) = std::env::var(LOCK_TIMEOUT_ENV) {
            self.lock_timeout_ms = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be an integer, got '{}'", LOCK_TIMEOUT_ENV, raw))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check invariants between fields
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(Error::Config("lock_timeout_ms must be positive".to_string()));
        }
        if self.async_queue_capacity_cap == 0 {
            return Err(Error::Config(
                "async_queue_capacity_cap must be positive".to_string(),
            ));
        }
        if self.max_locking_time_ms < self.batch_window_ms {
            return Err(Error::Config(
                "max_locking_time_ms must not be shorter than batch_window_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn short_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.short_lock_timeout_ms)
    }

    pub fn lru_retention(&self) -> Duration {
        Duration::from_secs(self.lru_retention_days * 24 * 3600)
    }

    pub fn soft_delete_grace(&self) -> Duration {
        Duration::from_secs(self.soft_delete_grace_secs)
    }

    pub fn hard_delete_delay(&self) -> Duration {
        Duration::from_secs(self.hard_delete_delay_secs)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn max_locking_time(&self) -> Duration {
        Duration::from_millis(self.max_locking_time_ms)
    }
}

/// Read the reserved-heap override, if set and valid
pub fn reserved_mb_from_env() -> Option<u64> {
    std::env::var(RESERVED_MB_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = CacheSettings::default();
        assert_eq!(settings.lock_timeout(), Duration::from_secs(60));
        assert_eq!(settings.batch_window(), Duration::from_millis(200));
        assert_eq!(settings.max_locking_time(), Duration::from_secs(5));
        assert_eq!(settings.soft_delete_grace(), Duration::from_secs(3600));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "lock_timeout_ms: 500\ncleanup_frequency: always\n";
        let settings: CacheSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.lock_timeout_ms, 500);
        assert_eq!(settings.cleanup_frequency, CleanupFrequency::Always);
        assert_eq!(settings.in_memory_max_entries, 10_000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.yaml");
        std::fs::write(&path, "lru_retention_days: 7\n").unwrap();
        let settings = CacheSettings::load(&path).unwrap();
        assert_eq!(settings.lru_retention(), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let settings = CacheSettings {
            lock_timeout_ms: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_locking_time() {
        let settings = CacheSettings {
            batch_window_ms: 1000,
            max_locking_time_ms: 10,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
