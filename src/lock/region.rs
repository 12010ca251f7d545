//! Byte-Range Locks
//!
//! Thin wrapper over `fcntl` record locks. On Linux the open-file-description
//! variants (`F_OFD_SETLK`) are used: they belong to the file handle rather
//! than to the process, so two handles on the same lock file contend even
//! inside one process, and they vanish when the handle is closed.

use std::fs::File;
use std::io;

/// A byte range locked on a lock file handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLock {
    /// Start offset of the range
    pub start: u64,
    /// Length of the range
    pub len: u64,
    /// Whether the range is held shared
    pub shared: bool,
}

impl RegionLock {
    /// Release the range on `file`
    pub fn release(&self, file: &File) -> io::Result<()> {
        sys::unlock(file, self.start, self.len)
    }
}

/// Try to lock `[start, start+len)` without blocking.
///
/// Returns `Ok(None)` when another handle holds a conflicting lock.
pub fn try_lock(file: &File, start: u64, len: u64, shared: bool) -> io::Result<Option<RegionLock>> {
    if sys::try_lock(file, start, len, shared)? {
        Ok(Some(RegionLock { start, len, shared }))
    } else {
        Ok(None)
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    #[cfg(target_os = "linux")]
    const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;

    #[cfg(not(target_os = "linux"))]
    const SET_LOCK: libc::c_int = libc::F_SETLK;

    fn request(file: &File, lock_type: libc::c_int, start: u64, len: u64) -> io::Result<bool> {
        // SAFETY: flock is plain old data; zero is a valid value for every field
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = lock_type as _;
        lock.l_whence = libc::SEEK_SET as _;
        lock.l_start = start as libc::off_t;
        lock.l_len = len as libc::off_t;

        // SAFETY: the descriptor is owned by `file` and outlives the call
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), SET_LOCK, &mut lock) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN || code == libc::EACCES => Ok(false),
            _ => Err(err),
        }
    }

    pub fn try_lock(file: &File, start: u64, len: u64, shared: bool) -> io::Result<bool> {
        let lock_type = if shared { libc::F_RDLCK } else { libc::F_WRLCK };
        request(file, lock_type, start, len)
    }

    pub fn unlock(file: &File, start: u64, len: u64) -> io::Result<()> {
        request(file, libc::F_UNLCK, start, len).map(|_| ())
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    pub fn try_lock(_file: &File, _start: u64, _len: u64, _shared: bool) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "byte-range file locks are only implemented for unix targets",
        ))
    }

    pub fn unlock(_file: &File, _start: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn open(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_exclusive_conflicts_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let a = open(&path);
        let b = open(&path);

        let held = try_lock(&a, 0, 17, false).unwrap().expect("first lock");
        assert!(try_lock(&b, 0, 17, false).unwrap().is_none());
        assert!(try_lock(&b, 0, 17, true).unwrap().is_none());

        held.release(&a).unwrap();
        assert!(try_lock(&b, 0, 17, false).unwrap().is_some());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let a = open(&path);
        let b = open(&path);

        assert!(try_lock(&a, 0, 17, true).unwrap().is_some());
        assert!(try_lock(&b, 0, 17, true).unwrap().is_some());
        assert!(try_lock(&b, 0, 17, false).unwrap().is_none());
    }

    #[test]
    fn test_disjoint_regions_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let a = open(&path);
        let b = open(&path);

        assert!(try_lock(&a, 0, 17, false).unwrap().is_some());
        assert!(try_lock(&b, 17, 2052, false).unwrap().is_some());
    }

    #[test]
    fn test_closing_handle_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let a = open(&path);
        let b = open(&path);

        assert!(try_lock(&a, 0, 17, false).unwrap().is_some());
        drop(a);
        assert!(try_lock(&b, 0, 17, false).unwrap().is_some());
    }
}
