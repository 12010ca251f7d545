//! Lock Info Region
//!
//! Identity of the current exclusive holder: the contention port it listens
//! on, its random lock id, its process id and a description of what it is
//! doing. Written right after the state region is acquired exclusively and
//! erased right before release.

use std::io::{self, Read, Write};

/// Reserved length of the info region
pub const INFORMATION_REGION_SIZE: u64 = 2052;

/// Info protocol version byte
const INFO_PROTOCOL_VERSION: u8 = 3;

/// Longest string we write, leaving room for the fixed header
const MAX_STRING_BYTES: usize = 1000;

/// Holder identity published in the info region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// UDP port the holder listens on for contention pings, -1 if none
    pub port: i32,
    /// Random id of the holder's lock
    pub lock_id: i64,
    /// Holder process id
    pub pid: String,
    /// Human readable operation the holder is performing
    pub operation: String,
}

impl Default for LockInfo {
    fn default() -> Self {
        Self {
            port: -1,
            lock_id: -1,
            pid: "unknown".to_string(),
            operation: "unknown".to_string(),
        }
    }
}

impl LockInfo {
    /// True when the region held no usable holder information
    pub fn is_unknown(&self) -> bool {
        self.port == -1 && self.lock_id == -1
    }

    /// Encode into `out`, truncating strings so the record fits the region
    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&[INFO_PROTOCOL_VERSION])?;
        out.write_all(&self.port.to_be_bytes())?;
        out.write_all(&self.lock_id.to_be_bytes())?;
        write_string(out, &self.pid)?;
        write_string(out, &self.operation)
    }

    /// Decode from `input`. An empty region yields the unknown holder.
    pub fn read_from(input: &mut impl Read) -> io::Result<LockInfo> {
        let mut version = [0u8; 1];
        match input.read_exact(&mut version) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(LockInfo::default()),
            Err(e) => return Err(e),
        }
        if version[0] != INFO_PROTOCOL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unexpected lock info protocol {}, expected {}",
                    version[0], INFO_PROTOCOL_VERSION
                ),
            ));
        }
        let mut port = [0u8; 4];
        input.read_exact(&mut port)?;
        let mut lock_id = [0u8; 8];
        input.read_exact(&mut lock_id)?;
        Ok(LockInfo {
            port: i32::from_be_bytes(port),
            lock_id: i64::from_be_bytes(lock_id),
            pid: read_string(input)?,
            operation: read_string(input)?,
        })
    }
}

fn write_string(out: &mut impl Write, value: &str) -> io::Result<()> {
    let mut end = value.len().min(MAX_STRING_BYTES);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &value.as_bytes()[..end];
    out.write_all(&(bytes.len() as u16).to_be_bytes())?;
    out.write_all(bytes)
}

fn read_string(input: &mut impl Read) -> io::Result<String> {
    let mut len = [0u8; 2];
    input.read_exact(&mut len)?;
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// =============================================================================
// Tests
// =============================================================================
