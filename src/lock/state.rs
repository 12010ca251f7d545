//! Lock State Protocols
//!
//! The state region records whether the last exclusive holder finished its
//! writes. Two encodings exist:
//!
//! - **Default** (version 3): creation number + sequence number. Sequence 0
//!   means "dirty"; every completed write bumps the sequence, so readers can
//!   also tell whether anybody wrote since they last looked.
//! - **Version1** (version 1): a single dirty byte, for caches shared with
//!   older clients. It cannot tell "updated since", so it always says yes.

use std::io::{self, Read, Write};

use rand::Rng;

/// Encoding of the state region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStateProtocol {
    /// Creation number + sequence number
    Default,
    /// Single dirty flag
    Version1,
}

impl LockStateProtocol {
    /// Protocol version byte written at the start of the state region
    pub fn version(&self) -> u8 {
        match self {
            LockStateProtocol::Default => 3,
            LockStateProtocol::Version1 => 1,
        }
    }

    /// Size of the encoded state, excluding the version byte
    pub fn size(&self) -> u64 {
        match self {
            LockStateProtocol::Default => 16,
            LockStateProtocol::Version1 => 1,
        }
    }

    /// Length of the whole state region, including the version byte
    pub fn region_len(&self) -> u64 {
        1 + self.size()
    }

    /// State of a lock file nobody has written yet
    pub fn initial_state(&self) -> LockState {
        match self {
            LockStateProtocol::Default => LockState::Sequence {
                creation_number: rand::thread_rng().gen(),
                original_sequence: -1,
                sequence: 0,
            },
            LockStateProtocol::Version1 => LockState::Version1 { dirty: true },
        }
    }

    /// Encode a state (without version byte)
    pub fn write(&self, out: &mut impl Write, state: &LockState) -> io::Result<()> {
        match (self, state) {
            (
                LockStateProtocol::Default,
                LockState::Sequence {
                    creation_number,
                    sequence,
                    ..
                },
            ) => {
                out.write_all(&creation_number.to_be_bytes())?;
                out.write_all(&sequence.to_be_bytes())
            }
            (LockStateProtocol::Version1, LockState::Version1 { dirty }) => {
                out.write_all(&[u8::from(!*dirty)])
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "lock state does not match the lock file protocol",
            )),
        }
    }

    /// Decode a state (without version byte)
    pub fn read(&self, input: &mut impl Read) -> io::Result<LockState> {
        match self {
            LockStateProtocol::Default => {
                let mut buf = [0u8; 8];
                input.read_exact(&mut buf)?;
                let creation_number = i64::from_be_bytes(buf);
                input.read_exact(&mut buf)?;
                let sequence = i64::from_be_bytes(buf);
                Ok(LockState::Sequence {
                    creation_number,
                    original_sequence: sequence,
                    sequence,
                })
            }
            LockStateProtocol::Version1 => {
                let mut buf = [0u8; 1];
                input.read_exact(&mut buf)?;
                Ok(LockState::Version1 { dirty: buf[0] == 0 })
            }
        }
    }
}

/// Persistent state stored in the state region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Default protocol state
    Sequence {
        /// Random number chosen when the lock file was first initialised
        creation_number: i64,
        /// Sequence number as read from disk (-1 for a fresh file)
        original_sequence: i64,
        /// Current sequence number; 0 while a write is in progress
        sequence: i64,
    },
    /// Cross-version protocol state
    Version1 { dirty: bool },
}

impl LockState {
    /// The last writer did not complete cleanly
    pub fn is_dirty(&self) -> bool {
        match self {
            LockState::Sequence { sequence, .. } => *sequence == 0,
            LockState::Version1 { dirty } => *dirty,
        }
    }

    /// Nobody has ever completed a write to this lock file
    pub fn is_in_initial_state(&self) -> bool {
        match self {
            LockState::Sequence {
                original_sequence, ..
            } => *original_sequence <= 0,
            LockState::Version1 { .. } => false,
        }
    }

    /// Whether the backing store may have changed since `previous` was taken
    pub fn has_been_updated_since(&self, previous: Option<&LockState>) -> bool {
        match (self, previous) {
            (
                LockState::Sequence {
                    creation_number,
                    sequence,
                    ..
                },
                Some(LockState::Sequence {
                    creation_number: prev_creation,
                    sequence: prev_sequence,
                    ..
                }),
            ) => creation_number != prev_creation || sequence != prev_sequence,
            _ => true,
        }
    }

    /// State to persist before running a write action
    pub fn before_update(&self) -> LockState {
        match *self {
            LockState::Sequence {
                creation_number,
                original_sequence,
                ..
            } => LockState::Sequence {
                creation_number,
                original_sequence,
                sequence: 0,
            },
            LockState::Version1 { .. } => LockState::Version1 { dirty: true },
        }
    }

    /// State to persist after a write action completed normally
    pub fn complete_update(&self) -> LockState {
        match *self {
            LockState::Sequence {
                creation_number,
                original_sequence,
                ..
            } => {
                let next = if original_sequence <= 0 {
                    1
                } else {
                    original_sequence + 1
                };
                LockState::Sequence {
                    creation_number,
                    original_sequence: next,
                    sequence: next,
                }
            }
            LockState::Version1 { .. } => LockState::Version1 { dirty: false },
        }
    }

    /// Sequence number for diagnostics, if the protocol has one
    pub fn sequence(&self) -> Option<i64> {
        match self {
            LockState::Sequence { sequence, .. } => Some(*sequence),
            LockState::Version1 { .. } => None,
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
    fn test_initial_state_is_dirty() {
        let state = LockStateProtocol::Default.initial_state();
        assert!(state.is_dirty());
        assert!(state.is_in_initial_state());

        let v1 = LockStateProtocol::Version1.initial_state();
        assert!(v1.is_dirty());
        assert!(!v1.is_in_initial_state());
    }

    #[test]
    fn test_update_cycle_bumps_sequence() {
        let state = LockStateProtocol::Default.initial_state();
        let dirty = state.before_update();
        assert!(dirty.is_dirty());
        let clean = dirty.complete_update();
        assert!(!clean.is_dirty());
        assert_eq!(clean.sequence(), Some(1));
        assert!(!clean.is_in_initial_state());

        let again = clean.before_update().complete_update();
        assert_eq!(again.sequence(), Some(2));
        assert!(again.has_been_updated_since(Some(&clean)));
        assert!(!again.has_been_updated_since(Some(&again)));
    }

    #[test]
    fn test_first_observation_counts_as_updated() {
        let state = LockStateProtocol::Default
            .initial_state()
            .before_update()
            .complete_update();
        assert!(state.has_been_updated_since(None));
    }

    #[test]
    fn test_version1_always_reports_updated() {
        let state = LockState::Version1 { dirty: false };
        assert!(state.has_been_updated_since(Some(&state)));
    }

    #[test]
    fn test_encode_decode_default() {
        let protocol = LockStateProtocol::Default;
        let state = protocol.initial_state().before_update().complete_update();
        let mut buf = Vec::new();
        protocol.write(&mut buf, &state).unwrap();
        assert_eq!(buf.len() as u64, protocol.size());
        let decoded = protocol.read(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.sequence(), state.sequence());
        assert!(!decoded.has_been_updated_since(Some(&state)));
    }

    #[test]
    fn test_encode_decode_version1() {
        let protocol = LockStateProtocol::Version1;
        let mut buf = Vec::new();
        protocol
            .write(&mut buf, &LockState::Version1 { dirty: false })
            .unwrap();
        assert_eq!(buf, vec![1]);
        assert!(!protocol.read(&mut buf.as_slice()).unwrap().is_dirty());
    }

    #[test]
    fn test_protocol_mismatch_rejected() {
        let mut buf = Vec::new();
        let result = LockStateProtocol::Version1.write(
            &mut buf,
            &LockStateProtocol::Default.initial_state(),
        );
        assert!(result.is_err());
    }
}
