//! No cross-process coordination at all

use std::sync::Weak;

use super::{CrossProcessCacheAccess, LockObserver, Releaser};
use crate::error::Result;

/// Access for caches private to this process. Releasing still tells the
/// observer the unit of work is finished so caches can flush.
pub struct NoLockingCacheAccess {
    observer: Weak<dyn LockObserver>,
}

impl NoLockingCacheAccess {
    pub fn new(observer: Weak<dyn LockObserver>) -> Self {
        Self { observer }
    }
}

impl CrossProcessCacheAccess for NoLockingCacheAccess {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn acquire_file_lock(&self) -> Result<Releaser> {
        let observer = self.observer.clone();
        Ok(Releaser::new(move || {
            if let Some(observer) = observer.upgrade() {
                observer.finish_work();
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::FileLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingObserver {
        finished: AtomicUsize,
    }

    impl LockObserver for CountingObserver {
        fn after_lock_acquire(&self, _lock: &Arc<FileLock>) {}

        fn before_lock_release(&self, _lock: &Arc<FileLock>) {}

        fn finish_work(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_notifies_finish_work() {
        let observer = Arc::new(CountingObserver::default());
        let weak: Weak<dyn LockObserver> = Arc::downgrade(&observer) as Weak<dyn LockObserver>;
        let access = NoLockingCacheAccess::new(weak);
        access.open().unwrap();
        assert_eq!(access.with_file_lock(|| Ok("done")).unwrap(), "done");
        access.acquire_file_lock().unwrap().release();
        assert_eq!(observer.finished.load(Ordering::SeqCst), 2);
        access.close();
    }
}
