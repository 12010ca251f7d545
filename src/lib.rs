//! Persistent Cache - Cross-Process Directory-Backed Cache
//!
//! Lets many processes, and many threads within each process, share a cache
//! directory safely. Access is coordinated through file locks with a
//! two-region lock-file protocol; caches stay bounded through cleanup.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         CacheCoordinator                          │
//! │   ownership (one thread at a time)  ·  registered indexed caches  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  CrossProcessCacheAccess      │  Indexed caches                   │
//! │  Fixed · OnDemand · None      │  in-memory → async worker → store │
//! ├───────────────────────────────┴──────────────────────────────────┤
//! │  FileLockManager: state + info regions, backoff, contention pings │
//! └──────────────────────────────────────────────────────────────────┘
//!   Cleanup: gc.properties gate · LRU · mark-and-sweep · version pruning
//! ```
//!
//! # Modules
//!
//! - [`lock`] - Cross-process file locks
//! - [`guard`] - Per-key producer exclusion within a process
//! - [`access`] - When the file lock is acquired and released
//! - [`coordinator`] - In-process ownership and cache registration
//! - [`indexed`] - Indexed caches, async write batching, in-memory layer
//! - [`store`] - Key/value store and serializers
//! - [`cleanup`] - Cleanup engines
//! - [`fine_grained`] - Per-key locked cache
//! - [`config`] - Settings
//! - [`error`] - Error types

pub mod access;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fine_grained;
pub mod guard;
pub mod indexed;
pub mod lock;
pub mod store;

// Re-export commonly used types
pub use access::{CacheAccess, CacheInitializationAction, CrossProcessCacheAccess, Releaser};
pub use cleanup::{CacheCleanupExecutor, CleanupFrequency, DefaultCacheCleanupExecutor};
pub use config::CacheSettings;
pub use coordinator::{CacheCoordinator, CacheCoordinatorBuilder, IndexedCacheParameters};
pub use error::{Error, Result};
pub use fine_grained::FineGrainedCache;
pub use guard::ProducerGuard;
pub use indexed::{IndexedCache, InMemoryDecoratorConfig};
pub use lock::{FileLock, FileLockManager, LockMode, LockOptions};
