//! Producer Guard
//!
//! Per-key mutual exclusion within one process: two threads producing the
//! same derived resource never run their producers concurrently.
//!
//! # Strategies
//!
//! | Strategy | Memory                         | Concurrency                    |
//! |----------|--------------------------------|--------------------------------|
//! | Adaptive | one entry per key in progress  | unrelated keys never block     |
//! | Striped  | fixed number of stripes        | keys sharing a stripe block    |
//! | Serial   | one lock                       | everything serialized          |

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use parking_lot::{Condvar, Mutex};

/// Default number of stripes of a striped guard
pub const DEFAULT_STRIPES: usize = 64;

/// Serializes producers by key
pub enum ProducerGuard<K> {
    /// Tracks the set of keys being produced
    Adaptive {
        producing: Mutex<HashSet<K>>,
        released: Condvar,
    },
    /// Hashes keys onto a fixed array of locks
    Striped { stripes: Vec<Mutex<()>> },
    /// A single lock for all keys
    Serial { lock: Mutex<()> },
}

impl<K> std::fmt::Debug for ProducerGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProducerGuard::Adaptive { .. } => write!(f, "ProducerGuard::Adaptive"),
            ProducerGuard::Striped { stripes } => {
                write!(f, "ProducerGuard::Striped({})", stripes.len())
            }
            ProducerGuard::Serial { .. } => write!(f, "ProducerGuard::Serial"),
        }
    }
}

impl<K: Eq + Hash + Clone> ProducerGuard<K> {
    pub fn adaptive() -> Self {
        ProducerGuard::Adaptive {
            producing: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Striped guard with `stripes` locks (at least one)
    pub fn striped(stripes: usize) -> Self {
        ProducerGuard::Striped {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn serial() -> Self {
        ProducerGuard::Serial {
            lock: Mutex::new(()),
        }
    }

    /// Run `producer` while no other producer for `key` runs in this process
    pub fn guard_by_key<T>(&self, key: &K, producer: impl FnOnce() -> T) -> T {
        match self {
            ProducerGuard::Adaptive {
                producing,
                released,
            } => {
                {
                    let mut in_progress = producing.lock();
                    while in_progress.contains(key) {
                        released.wait(&mut in_progress);
                    }
                    in_progress.insert(key.clone());
                }
                let _release = KeyRelease {
                    key,
                    producing,
                    released,
                };
                producer()
            }
            ProducerGuard::Striped { stripes } => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                let stripe = (hasher.finish() % stripes.len() as u64) as usize;
                let _held = stripes[stripe].lock();
                producer()
            }
            ProducerGuard::Serial { lock } => {
                let _held = lock.lock();
                producer()
            }
        }
    }
}

/// Removes an adaptive key on scope exit, including unwinding
struct KeyRelease<'a, K: Eq + Hash> {
    key: &'a K,
    producing: &'a Mutex<HashSet<K>>,
    released: &'a Condvar,
}

impl<K: Eq + Hash> Drop for KeyRelease<'_, K> {
    fn drop(&mut self) {
        self.producing.lock().remove(self.key);
        self.released.notify_all();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn assert_no_interleaving(guard: Arc<ProducerGuard<String>>) {
        let active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let guard = guard.clone();
                let active = active.clone();
                let runs = runs.clone();
                std::thread::spawn(move || {
                    guard.guard_by_key(&"k".to_string(), || {
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(Duration::from_millis(10));
                        active.fetch_sub(1, Ordering::SeqCst);
                        runs.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_adaptive_serializes_same_key() {
        assert_no_interleaving(Arc::new(ProducerGuard::adaptive()));
    }

    #[test]
    fn test_striped_serializes_same_key() {
        assert_no_interleaving(Arc::new(ProducerGuard::striped(8)));
    }

    #[test]
    fn test_serial_serializes_same_key() {
        assert_no_interleaving(Arc::new(ProducerGuard::serial()));
    }

    #[test]
    fn test_adaptive_different_keys_run_concurrently() {
        let guard = Arc::new(ProducerGuard::<u32>::adaptive());
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        let inner = guard.clone();
        let handle = std::thread::spawn(move || {
            inner.guard_by_key(&1, || rx.recv_timeout(Duration::from_secs(5)).is_ok())
        });
        // Key 2 is free while key 1 is held, so this can hand over the token
        guard.guard_by_key(&2, || tx.send_timeout((), Duration::from_secs(5)).unwrap());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_adaptive_releases_key_on_panic() {
        let guard = Arc::new(ProducerGuard::<u32>::adaptive());
        let inner = guard.clone();
        let result = std::thread::spawn(move || inner.guard_by_key(&7, || panic!("producer failed"))).join();
        assert!(result.is_err());
        assert_eq!(guard.guard_by_key(&7, || 42), 42);
    }
}
