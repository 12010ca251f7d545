//! Async Cache Access Worker
//!
//! One dedicated thread applies queued cache work. Instead of taking the
//! coordinator (and with it the file lock) for each small write, the worker
//! takes it once and keeps draining the queue:
//!
//! ```text
//!   enqueue / read ──► bounded queue ──► worker thread
//!                                          │
//!                       first task ───────►│ use_cache {
//!                                          │   run task
//!                                          │   poll(batch window) ─► run ...
//!                                          │   until idle, a control item,
//!                                          │   or the max locking time
//!                                          │ }
//! ```
//!
//! Failures of queued writes do not stop the worker. The first one is kept
//! and rethrown from the next `flush()` or `stop()`.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error};

use super::sizer::HeapProportionalCacheSizer;
use crate::config::CacheSettings;
use crate::error::{Error, Result};

/// Reference queue size before heap-proportional scaling
const REFERENCE_QUEUE_CAPACITY: usize = 40_000;

/// Exclusive in-process access to the coordinator the worker writes through
pub trait ExclusiveAccess: Send + Sync {
    /// Run `batch` as one unit of work holding the file lock
    fn use_cache_batch(&self, batch: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    fn is_owned_by_current_thread(&self) -> bool;
}

type Task = Box<dyn FnOnce() -> Result<()> + Send>;

enum WorkItem {
    Task(Task),
    Flush(Sender<()>),
    Stop(Sender<()>),
}

struct WorkerShared {
    display_name: String,
    failure: Mutex<Option<Error>>,
    alive: AtomicBool,
}

impl WorkerShared {
    fn record_failure(&self, failure: Error) {
        error!("Failed to execute cache operation on {}: {}", self.display_name, failure);
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    fn rethrow_failure(&self) -> Result<()> {
        match self.failure.lock().take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn process(&self, task: Task) {
        match catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.record_failure(e),
            Err(panic) => self.record_failure(Error::AsyncWorker {
                cache: self.display_name.clone(),
                reason: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "cache operation panicked".to_string()
    }
}

/// Queue consumer batching cache work under one lock acquisition
pub struct AsyncCacheAccessWorker {
    shared: Arc<WorkerShared>,
    sender: Sender<WorkItem>,
    access: Arc<dyn ExclusiveAccess>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
}

impl std::fmt::Debug for AsyncCacheAccessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCacheAccessWorker")
            .field("display_name", &self.shared.display_name)
            .field("queued", &self.sender.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl AsyncCacheAccessWorker {
    /// Start the worker thread
    pub fn spawn(
        display_name: &str,
        access: Arc<dyn ExclusiveAccess>,
        settings: &CacheSettings,
    ) -> Result<Self> {
        let capacity = HeapProportionalCacheSizer::from_settings(settings)
            .scale_cache_size(REFERENCE_QUEUE_CAPACITY)
            .min(settings.async_queue_capacity_cap);
        Self::spawn_with(
            display_name,
            access,
            capacity,
            settings.batch_window(),
            settings.max_locking_time(),
        )
    }

    /// Start the worker thread with explicit queue and batching limits
    pub fn spawn_with(
        display_name: &str,
        access: Arc<dyn ExclusiveAccess>,
        capacity: usize,
        batch_window: Duration,
        max_locking_time: Duration,
    ) -> Result<Self> {
        let capacity = capacity.max(1);
        let (sender, receiver) = channel::bounded(capacity);
        let shared = Arc::new(WorkerShared {
            display_name: display_name.to_string(),
            failure: Mutex::new(None),
            alive: AtomicBool::new(true),
        });

        let loop_shared = shared.clone();
        let loop_access = access.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{} access worker", display_name))
            .spawn(move || {
                run(&loop_shared, &receiver, loop_access.as_ref(), batch_window, max_locking_time);
                loop_shared.alive.store(false, Ordering::SeqCst);
                debug!("Access worker for {} stopped", loop_shared.display_name);
            })?;

        Ok(Self {
            shared,
            sender,
            access,
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the calling thread currently owns the coordinator
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.access.is_owned_by_current_thread()
    }

    fn closed_error(&self) -> Error {
        Error::AsyncWorker {
            cache: self.shared.display_name.clone(),
            reason: "the access worker has been stopped".to_string(),
        }
    }

    fn submit(&self, task: Task) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        match self.sender.try_send(WorkItem::Task(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(WorkItem::Task(task))) if self.access.is_owned_by_current_thread() => {
                // The worker cannot drain while we own the coordinator
                self.shared.process(task);
                Ok(())
            }
            Err(TrySendError::Full(item)) => {
                self.sender.send(item).map_err(|_| self.closed_error())
            }
            Err(TrySendError::Disconnected(_)) => Err(self.closed_error()),
        }
    }

    /// Queue a write. Its failure surfaces from the next flush or stop.
    pub fn enqueue(&self, task: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.submit(Box::new(task))
    }

    /// Run a read on the worker and wait for its result.
    ///
    /// The owning thread of the coordinator runs the read itself, since the
    /// worker could not get the coordinator until it returns.
    pub fn read<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T> {
        if self.access.is_owned_by_current_thread() {
            return task();
        }
        let (reply, result) = channel::bounded(1);
        self.submit(Box::new(move || {
            let _ = reply.send(task());
            Ok(())
        }))?;
        result.recv().map_err(|_| Error::AsyncWorker {
            cache: self.shared.display_name.clone(),
            reason: "read was dropped before it completed".to_string(),
        })?
    }

    /// Wait until everything queued so far has been applied
    pub fn flush(&self) -> Result<()> {
        if self.access.is_owned_by_current_thread() {
            return Err(Error::AsyncWorker {
                cache: self.shared.display_name.clone(),
                reason: "cannot flush from the thread owning the cache".to_string(),
            });
        }
        if self.shared.alive.load(Ordering::SeqCst) {
            let (done, wait) = channel::bounded(1);
            if self.sender.send(WorkItem::Flush(done)).is_ok() {
                let _ = wait.recv();
            }
        } else if self.shared.failure.lock().is_none() {
            return Err(self.closed_error());
        }
        self.shared.rethrow_failure()
    }

    /// Apply everything queued, then stop the worker thread
    pub fn stop(&self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let (done, wait) = channel::bounded(1);
            if self.sender.send(WorkItem::Stop(done)).is_ok() {
                let _ = wait.recv();
            }
            let handle = self.handle.lock().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
        self.shared.rethrow_failure()
    }
}

fn run(
    shared: &WorkerShared,
    receiver: &Receiver<WorkItem>,
    access: &dyn ExclusiveAccess,
    batch_window: Duration,
    max_locking_time: Duration,
) {
    let mut pending: Option<WorkItem> = None;
    loop {
        let item = match pending.take() {
            Some(item) => item,
            None => match receiver.recv() {
                Ok(item) => item,
                Err(_) => return,
            },
        };
        match item {
            WorkItem::Stop(done) => {
                let _ = done.send(());
                return;
            }
            WorkItem::Flush(done) => {
                let _ = done.send(());
            }
            WorkItem::Task(first) => {
                let started = Instant::now();
                let mut first = Some(first);
                let mut control = None;
                let mut batch = || -> Result<()> {
                    if let Some(task) = first.take() {
                        shared.process(task);
                    }
                    while started.elapsed() < max_locking_time {
                        match receiver.recv_timeout(batch_window) {
                            Ok(WorkItem::Task(task)) => shared.process(task),
                            Ok(other) => {
                                control = Some(other);
                                break;
                            }
                            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                                break
                            }
                        }
                    }
                    Ok(())
                };
                if let Err(e) = access.use_cache_batch(&mut batch) {
                    shared.record_failure(e);
                }
                pending = control;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    /// Counts batches; never owned by the test thread
    #[derive(Default)]
    struct CountingAccess {
        batches: AtomicUsize,
    }

    impl ExclusiveAccess for CountingAccess {
        fn use_cache_batch(&self, batch: &mut dyn FnMut() -> Result<()>) -> Result<()> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            batch()
        }

        fn is_owned_by_current_thread(&self) -> bool {
            false
        }
    }

    fn worker(access: Arc<CountingAccess>) -> AsyncCacheAccessWorker {
        AsyncCacheAccessWorker::spawn_with(
            "test cache",
            access,
            64,
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_queued_writes_are_batched() {
        let access = Arc::new(CountingAccess::default());
        let worker = worker(access.clone());
        let applied = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let applied = applied.clone();
            worker
                .enqueue(move || {
                    applied.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        worker.flush().unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 10);
        assert!(access.batches.load(Ordering::SeqCst) <= 2);
        worker.stop().unwrap();
    }

    #[test]
    fn test_read_returns_value() {
        let worker = worker(Arc::new(CountingAccess::default()));
        assert_eq!(worker.read(|| Ok(41 + 1)).unwrap(), 42);
        worker.stop().unwrap();
    }

    #[test]
    fn test_failure_is_rethrown_once_and_worker_continues() {
        let worker = worker(Arc::new(CountingAccess::default()));
        worker
            .enqueue(|| Err(Error::Serialization("bad value".to_string())))
            .unwrap();
        let applied = Arc::new(AtomicBool::new(false));
        let flag = applied.clone();
        worker
            .enqueue(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_matches!(worker.flush(), Err(Error::Serialization(_)));
        assert!(applied.load(Ordering::SeqCst));
        assert!(worker.flush().is_ok());
        worker.stop().unwrap();
    }

    #[test]
    fn test_panicking_task_is_reported() {
        let worker = worker(Arc::new(CountingAccess::default()));
        worker.enqueue(|| panic!("boom")).unwrap();
        assert_matches!(worker.stop(), Err(Error::AsyncWorker { reason, .. }) if reason == "boom");
    }

    #[test]
    fn test_enqueue_after_stop_fails() {
        let worker = worker(Arc::new(CountingAccess::default()));
        worker.stop().unwrap();
        assert_matches!(worker.enqueue(|| Ok(())), Err(Error::AsyncWorker { .. }));
        assert!(worker.stop().is_ok());
    }

    #[test]
    fn test_stop_drains_queue() {
        let worker = worker(Arc::new(CountingAccess::default()));
        let applied = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let applied = applied.clone();
            worker
                .enqueue(move || {
                    std::thread::sleep(Duration::from_millis(5));
                    applied.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        worker.stop().unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 5);
    }
}
