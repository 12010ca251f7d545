//! Property-Based Tests for Lock Files
//!
//! # Test Properties
//!
//! 1. **Sequence Monotonicity**: every completed update bumps the sequence
//!    and is visible through `has_been_updated_since`
//! 2. **Crash Detection**: an update that never completes stays dirty
//! 3. **Info Bounds**: any holder description fits the reserved info region
//! 4. **Backoff Bounds**: delays never exceed `min(attempt, 100)` slots

#![cfg(test)]

use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::backoff::ExponentialBackoff;
use super::info::{LockInfo, INFORMATION_REGION_SIZE};
use super::state::LockStateProtocol;

// =============================================================================
// Property Strategies
// =============================================================================

/// Holder descriptions, including multi-byte characters and oversize values
fn holder_strategy() -> impl Strategy<Value = (i32, i64, String, String)> {
    (
        any::<i32>(),
        any::<i64>(),
        "[0-9]{1,12}",
        prop::string::string_regex(".{0,1500}").unwrap(),
    )
}

// =============================================================================
// Lock State Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_completed_updates_bump_sequence(updates in 1usize..50) {
        let protocol = LockStateProtocol::Default;
        let mut state = protocol.initial_state();
        for n in 1..=updates {
            let previous = state;
            let dirty = state.before_update();
            prop_assert!(dirty.is_dirty());
            state = dirty.complete_update();
            prop_assert!(!state.is_dirty());
            prop_assert_eq!(state.sequence(), Some(n as i64));
            prop_assert!(state.has_been_updated_since(Some(&previous)));
        }
    }

    #[test]
    fn prop_interrupted_update_stays_dirty(clean_updates in 0usize..20) {
        let protocol = LockStateProtocol::Default;
        let mut state = protocol.initial_state();
        for _ in 0..clean_updates {
            state = state.before_update().complete_update();
        }
        let crashed = state.before_update();

        let mut buf = Vec::new();
        protocol.write(&mut buf, &crashed).unwrap();
        let reopened = protocol.read(&mut buf.as_slice()).unwrap();
        prop_assert!(reopened.is_dirty());
    }

    #[test]
    fn prop_info_fits_region((port, lock_id, pid, operation) in holder_strategy()) {
        let info = LockInfo { port, lock_id, pid, operation };
        let mut buf = Vec::new();
        info.write_to(&mut buf).unwrap();
        prop_assert!(buf.len() as u64 <= INFORMATION_REGION_SIZE);

        let decoded = LockInfo::read_from(&mut buf.as_slice()).unwrap();
        prop_assert_eq!(decoded.port, port);
        prop_assert_eq!(decoded.lock_id, lock_id);
        prop_assert!(info.operation.starts_with(&decoded.operation));
    }
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_backoff_delay_is_bounded(attempts in 1u32..300, seed in any::<u64>()) {
        let slot = Duration::from_millis(25);
        let mut backoff = ExponentialBackoff::with_slot_time(Duration::from_secs(60), slot);
        let mut rng = StdRng::seed_from_u64(seed);
        for n in 1..=attempts {
            let delay = backoff.next_delay(&mut rng);
            prop_assert!(delay < slot * n.min(100));
            prop_assert_eq!(backoff.attempt(), n);
        }
    }
}
