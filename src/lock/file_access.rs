//! Lock File Access
//!
//! Reads and writes the two regions of an open lock file. Region locking is
//! done by the caller through [`LockFileAccess::try_lock_state`] and
//! [`LockFileAccess::try_lock_info`]; this type only knows the layout.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::info::{LockInfo, INFORMATION_REGION_SIZE};
use super::region::{self, RegionLock};
use super::state::{LockState, LockStateProtocol};
use crate::error::{Error, Result};

/// Handle on a lock file
pub struct LockFileAccess {
    path: PathBuf,
    protocol: LockStateProtocol,
    file: Mutex<File>,
}

impl std::fmt::Debug for LockFileAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFileAccess")
            .field("path", &self.path)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl LockFileAccess {
    /// Open (creating if needed) the lock file at `path`
    pub fn open(path: &Path, protocol: LockStateProtocol) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            protocol,
            file: Mutex::new(file),
        })
    }

    /// Open an existing lock file for reading only; `None` if it is missing
    fn open_existing(path: &Path, protocol: LockStateProtocol) -> Result<Option<Self>> {
        match File::open(path) {
            Ok(file) => Ok(Some(Self {
                path: path.to_path_buf(),
                protocol,
                file: Mutex::new(file),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn protocol(&self) -> LockStateProtocol {
        self.protocol
    }

    fn info_start(&self) -> u64 {
        self.protocol.region_len()
    }

    // =========================================================================
    // Region locks
    // =========================================================================

    /// Try to lock the state region without blocking
    pub fn try_lock_state(&self, shared: bool) -> Result<Option<RegionLock>> {
        let file = self.file.lock();
        Ok(region::try_lock(&file, 0, self.protocol.region_len(), shared)?)
    }

    /// Try to lock the info region without blocking
    pub fn try_lock_info(&self, shared: bool) -> Result<Option<RegionLock>> {
        let file = self.file.lock();
        Ok(region::try_lock(
            &file,
            self.info_start(),
            INFORMATION_REGION_SIZE,
            shared,
        )?)
    }

    /// Release a region previously locked through this handle
    pub fn release(&self, lock: RegionLock) -> Result<()> {
        let file = self.file.lock();
        Ok(lock.release(&file)?)
    }

    // =========================================================================
    // State region
    // =========================================================================

    /// Read the state, writing the initial state if the file is new.
    ///
    /// Requires the state region to be held exclusively.
    pub fn ensure_lock_state(&self) -> Result<LockState> {
        let len = self.file.lock().metadata()?.len();
        if len == 0 {
            let state = self.protocol.initial_state();
            self.write_lock_state(&state)?;
            return Ok(state);
        }
        self.read_lock_state()
    }

    /// Read the state; a short file reads as the initial state
    pub fn read_lock_state(&self) -> Result<LockState> {
        let mut file = self.file.lock();
        let len = self.protocol.region_len() as usize;
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(0))?;
        let read = read_fully(&mut *file, &mut buf)?;
        if read == 0 {
            return Ok(self.protocol.initial_state());
        }
        if buf[0] != self.protocol.version() {
            return Err(Error::UnexpectedLockProtocol {
                lock_file: self.path.clone(),
                expected: self.protocol.version(),
                found: buf[0],
            });
        }
        if read < len {
            return Ok(self.protocol.initial_state());
        }
        let mut cursor = Cursor::new(&buf[1..]);
        Ok(self.protocol.read(&mut cursor)?)
    }

    /// Persist `state` into the state region
    pub fn write_lock_state(&self, state: &LockState) -> Result<()> {
        let mut buf = Vec::with_capacity(self.protocol.region_len() as usize);
        buf.push(self.protocol.version());
        self.protocol.write(&mut buf, state)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    /// Persist the dirty form of `state` and return it
    pub fn mark_dirty(&self, state: &LockState) -> Result<LockState> {
        let dirty = state.before_update();
        self.write_lock_state(&dirty)?;
        Ok(dirty)
    }

    /// Persist the completed form of `state` and return it
    pub fn mark_clean(&self, state: &LockState) -> Result<LockState> {
        let clean = state.complete_update();
        self.write_lock_state(&clean)?;
        Ok(clean)
    }

    // =========================================================================
    // Info region
    // =========================================================================

    /// Publish holder identity. Requires the info region held exclusively.
    pub fn write_lock_info(&self, info: &LockInfo) -> Result<()> {
        let mut buf = Vec::new();
        info.write_to(&mut buf)?;

        let start = self.info_start();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(start))?;
        file.write_all(&buf)?;
        file.set_len(start + buf.len() as u64)?;
        Ok(())
    }

    /// Read holder identity; an empty region yields the unknown holder
    pub fn read_lock_info(&self) -> Result<LockInfo> {
        let start = self.info_start();
        let mut file = self.file.lock();
        if file.metadata()?.len() <= start {
            return Ok(LockInfo::default());
        }
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::new();
        (&mut *file)
            .take(INFORMATION_REGION_SIZE)
            .read_to_end(&mut buf)?;
        Ok(LockInfo::read_from(&mut buf.as_slice())?)
    }

    /// Erase holder identity
    pub fn clear_lock_info(&self) -> Result<()> {
        let start = self.info_start();
        let file = self.file.lock();
        file.set_len(start)?;
        Ok(())
    }

    /// Read state and holder of a lock file without waiting or creating it.
    ///
    /// Returns `None` when there is no lock file. Each region is only read if
    /// a shared lock on it can be taken right away; a `None` state means it
    /// is held exclusively by someone else.
    pub fn inspect(path: &Path, protocol: LockStateProtocol) -> Result<Option<(Option<LockState>, LockInfo)>> {
        let Some(access) = LockFileAccess::open_existing(path, protocol)? else {
            return Ok(None);
        };
        let state = match access.try_lock_state(true)? {
            Some(lock) => {
                let state = access.read_lock_state();
                access.release(lock)?;
                Some(state?)
            }
            None => None,
        };
        let info = match access.try_lock_info(true)? {
            Some(lock) => {
                let info = access.read_lock_info();
                access.release(lock)?;
                info?
            }
            None => LockInfo::default(),
        };
        Ok(Some((state, info)))
    }
}

fn read_fully(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match input.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

// =============================================================================
// Tests
// =============================================================================
