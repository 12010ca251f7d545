//! Error types for the persistent cache

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while locking, using or cleaning a persistent cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Locking Errors
    // =========================================================================
    /// Could not acquire the OS lock within the configured timeout
    #[error(
        "Timeout waiting to lock {display_name}. It is currently in use by another process.\n\
         Owner PID: {owner_pid}\nOur PID: {our_pid}\nOwner Operation: {owner_operation}\n\
         Our operation: {our_operation}\nLock file: {}",
        lock_file.display()
    )]
    LockTimeout {
        display_name: String,
        lock_file: PathBuf,
        owner_pid: String,
        owner_operation: String,
        our_pid: String,
        our_operation: String,
    },

    /// This process already holds a lock on the canonical target
    #[error("Cannot lock {0} as it has already been locked by this process.")]
    AlreadyLocked(String),

    /// Operation attempted on a lock that has been closed
    #[error("This lock has been closed: {0}")]
    LockClosed(String),

    /// A write was attempted while holding only a shared lock
    #[error("An exclusive lock is required for this operation on {0}")]
    InsufficientLockMode(String),

    /// The lock file's state region was written by an incompatible protocol
    #[error("Unexpected lock protocol found in lock file {}. Expected {expected}, found {found}.", lock_file.display())]
    UnexpectedLockProtocol {
        lock_file: PathBuf,
        expected: u8,
        found: u8,
    },

    /// Unable to lock the information region while holding the state region
    #[error("Unable to lock the information region for {0}")]
    InformationRegion(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// The previous writer did not release the lock cleanly
    #[error("The file '{}' was not unlocked cleanly", .0.display())]
    FileIntegrityViolation(PathBuf),

    // =========================================================================
    // Cache Lifecycle Errors
    // =========================================================================
    /// Two incompatible registrations for the same cache name
    #[error("Cache '{cache_name}' couldn't be reused because of the following mismatch:\n{}", mismatches.join("\n"))]
    InvalidCacheReuse {
        cache_name: String,
        mismatches: Vec<String>,
    },

    /// Cache initialization did not converge
    #[error("Could not open {display_name}: {reason}")]
    CacheOpen { display_name: String, reason: String },

    /// `open()` called on an already open coordinator
    #[error("Cache {0} is already open.")]
    AlreadyOpen(String),

    /// Operation requires an open coordinator
    #[error("Cache {0} is not open.")]
    NotOpen(String),

    /// Ownership violation (another thread owns the coordinator)
    #[error("{0}")]
    NotOwner(String),

    /// Lock reference count misuse
    #[error("Illegal lock state: {0}")]
    IllegalLockState(String),

    // =========================================================================
    // Async Worker Errors
    // =========================================================================
    /// A queued task failed, or the worker is gone
    #[error("Async cache access failed for {cache}: {reason}")]
    AsyncWorker { cache: String, reason: String },

    // =========================================================================
    // Serialization & Configuration Errors
    // =========================================================================
    /// Value or key (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cleanup failure (logged and swallowed by the cleanup executor)
    #[error("Cleanup of {store} failed: {reason}")]
    Cleanup { store: String, reason: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    /// True for errors that only signal a lock could not be obtained in time
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }

    /// True when the cache content must not be trusted
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Error::FileIntegrityViolation(_))
    }
}

// =============================================================================
// Tests
// =============================================================================
