//! Cross-Process File Locking
//!
//! Every lock target (a cache directory or a file) owns a companion
//! `<name>.lock` file split into two byte-range regions:
//!
//! ```text
//! ┌───────────────────────────┬──────────────────────────────────────────┐
//! │ State region              │ Info region (2052 bytes reserved)        │
//! │ [version][lock state ...] │ [version][port][lock id][pid][operation] │
//! │ persistent dirty/clean    │ transient, only while held exclusively   │
//! └───────────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The state region is locked in the requested mode for the whole lifetime
//! of a [`FileLock`]. The info region is only locked briefly, to publish or
//! read the identity of the current exclusive holder. A waiting process uses
//! that identity to ping the holder over UDP and ask it to release.

mod backoff;
mod contention;
mod file_access;
mod info;
mod manager;
#[cfg(test)]
mod proptest;
mod region;
mod state;

pub use backoff::{Attempt, ExponentialBackoff, WakeSignal};
pub use contention::{ContentionHandler, ReleaseSignal, WhenContended};
pub use file_access::LockFileAccess;
pub use info::{LockInfo, INFORMATION_REGION_SIZE};
pub use manager::{FileLock, FileLockManager, LockedFiles};
pub use state::{LockState, LockStateProtocol};

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Identifier of this process as published in lock info regions
pub static PROCESS_ID: Lazy<String> = Lazy::new(|| std::process::id().to_string());

/// Lock mode requested for a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Many concurrent holders, no writer
    Shared,
    /// One holder, may write
    Exclusive,
    /// Exclusive, acquired lazily and released on contention
    OnDemand,
    /// No cross-process coordination at all
    None,
}

impl LockMode {
    /// True for the lazily acquired mode
    pub fn is_on_demand(&self) -> bool {
        matches!(self, LockMode::OnDemand)
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
            LockMode::OnDemand => write!(f, "on-demand"),
            LockMode::None => write!(f, "none"),
        }
    }
}

/// Options used when locking a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Requested lock mode
    pub mode: LockMode,
    /// Use the single-byte state protocol understood by older clients
    pub use_cross_version_impl: bool,
}

impl LockOptions {
    /// Options for the given mode using the default protocol
    pub fn mode(mode: LockMode) -> Self {
        Self {
            mode,
            use_cross_version_impl: false,
        }
    }

    /// Switch to the cross-version protocol
    pub fn cross_version(mut self) -> Self {
        self.use_cross_version_impl = true;
        self
    }

    /// Same options with a different mode
    pub fn with_mode(self, mode: LockMode) -> Self {
        Self { mode, ..self }
    }

    pub(crate) fn protocol(&self) -> LockStateProtocol {
        if self.use_cross_version_impl {
            LockStateProtocol::Version1
        } else {
            LockStateProtocol::Default
        }
    }
}

/// Compute the lock file for a target.
///
/// A directory `d` is locked through `d/<name of d>.lock`, a file `f`
/// through `<parent of f>/<name of f>.lock`.
pub fn lock_file_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".to_string());
    let file_name = format!("{}.lock", name);
    if target.is_dir() {
        target.join(file_name)
    } else {
        match target.parent() {
            Some(parent) => parent.join(file_name),
            None => PathBuf::from(file_name),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_file_for_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("modules-2");
        std::fs::create_dir(&target).unwrap();
        assert_eq!(lock_file_for(&target), target.join("modules-2.lock"));
    }

    #[test]
    fn test_lock_file_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("hashes.bin");
        assert_eq!(lock_file_for(&target), dir.path().join("hashes.bin.lock"));
    }

    #[test]
    fn test_lock_options_protocol() {
        assert_eq!(
            LockOptions::mode(LockMode::Exclusive).protocol(),
            LockStateProtocol::Default
        );
        assert_eq!(
            LockOptions::mode(LockMode::Shared).cross_version().protocol(),
            LockStateProtocol::Version1
        );
        let opts = LockOptions::mode(LockMode::OnDemand).with_mode(LockMode::Exclusive);
        assert_eq!(opts.mode, LockMode::Exclusive);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(LockMode::OnDemand.to_string(), "on-demand");
        assert!(LockMode::OnDemand.is_on_demand());
        assert!(!LockMode::Shared.is_on_demand());
    }
}
