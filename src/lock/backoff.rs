//! Exponential Backoff
//!
//! Retry loop used while waiting for a contended lock region. The policy is
//! a plain state machine (attempt counter + timer) so it can be tested
//! without threads; waiting happens on a [`WakeSignal`] channel that the
//! contention handler fires when the holder confirms it released the lock.
//!
//! Delay for attempt `n` is `uniform(0..min(n, 100)) * 25ms`. Being woken
//! early resets the attempt counter, since the next try is likely to win.

use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rand::Rng;

/// Slot time multiplied by the random factor
pub const SLOT_TIME: Duration = Duration::from_millis(25);

/// Upper bound of the random factor
const CAP_FACTOR: u32 = 100;

/// Outcome of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// Stop retrying with this value
    Done(T),
    /// Try again later; the value is returned if the timer expires
    Retry(T),
}

/// Wake-up channel shared between a waiting backoff and whoever can tell it
/// that retrying now is worthwhile
#[derive(Debug, Clone)]
pub struct WakeSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// Handle used to wake the waiter
    pub fn sender(&self) -> Sender<()> {
        self.tx.clone()
    }

    /// Wake the waiter, if any
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Wait up to `timeout`; true when woken early
    pub fn await_for(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => {
                // Coalesce wake-ups that piled up while we were busy
                while self.rx.try_recv().is_ok() {}
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Backoff state for one wait
#[derive(Debug)]
pub struct ExponentialBackoff {
    timeout: Duration,
    slot_time: Duration,
    started: Instant,
    attempt: u32,
    signal: WakeSignal,
}

impl ExponentialBackoff {
    /// Backoff bounded by `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self::with_slot_time(timeout, SLOT_TIME)
    }

    /// Backoff with a custom slot time
    pub fn with_slot_time(timeout: Duration, slot_time: Duration) -> Self {
        Self {
            timeout,
            slot_time,
            started: Instant::now(),
            attempt: 0,
            signal: WakeSignal::new(),
        }
    }

    /// Signal that wakes this backoff early
    pub fn signal(&self) -> &WakeSignal {
        &self.signal
    }

    /// Number of failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time since the timer was (re)started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the timeout has been reached
    pub fn has_expired(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    /// Start a fresh timeout, e.g. because a different holder appeared
    pub fn restart_timer(&mut self) {
        self.started = Instant::now();
    }

    /// Maximum delay for the next wait, before randomisation
    pub fn max_delay_for(&self, attempt: u32) -> Duration {
        self.slot_time * attempt.min(CAP_FACTOR)
    }

    /// Register a failed attempt and compute how long to wait next
    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let factor = rng.gen_range(0..self.attempt.min(CAP_FACTOR));
        self.slot_time * factor
    }

    /// Woken early: the next attempt starts from scratch
    pub fn on_signaled(&mut self) {
        self.attempt = 0;
    }

    /// Run `query` until it reports [`Attempt::Done`] or the timer expires.
    ///
    /// The value of the last attempt is returned on expiry. Errors abort the
    /// loop immediately.
    pub fn retry_until<T, E>(
        &mut self,
        mut query: impl FnMut(&mut Self) -> Result<Attempt<T>, E>,
    ) -> Result<T, E> {
        let mut rng = rand::thread_rng();
        loop {
            let value = match query(self)? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(value) => value,
            };
            if self.has_expired() {
                return Ok(value);
            }
            let delay = self.next_delay(&mut rng);
            if self.signal.await_for(delay) {
                self.on_signaled();
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
    use std::convert::Infallible;

    #[test]
    fn test_succeeds_immediately() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1));
        let result: Result<u32, Infallible> = backoff.retry_until(|_| Ok(Attempt::Done(7)));
        assert_eq!(result.unwrap(), 7);
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn test_retries_until_success() {
        let mut backoff =
            ExponentialBackoff::with_slot_time(Duration::from_secs(5), Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<u32, Infallible> = backoff.retry_until(|_| {
            calls += 1;
            Ok(if calls == 4 {
                Attempt::Done(calls)
            } else {
                Attempt::Retry(calls)
            })
        });
        assert_eq!(result.unwrap(), 4);
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_returns_last_value_on_expiry() {
        let mut backoff =
            ExponentialBackoff::with_slot_time(Duration::from_millis(30), Duration::from_millis(2));
        let result: Result<&str, Infallible> = backoff.retry_until(|_| Ok(Attempt::Retry("busy")));
        assert_eq!(result.unwrap(), "busy");
        assert!(backoff.has_expired());
    }

    #[test]
    fn test_error_aborts() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5));
        let result: Result<(), &str> = backoff.retry_until(|_| Err("io"));
        assert_eq!(result, Err("io"));
    }

    #[test]
    fn test_signal_resets_attempts() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5));
        let mut rng = rand::thread_rng();
        backoff.next_delay(&mut rng);
        backoff.next_delay(&mut rng);
        assert_eq!(backoff.attempt(), 2);
        backoff.on_signaled();
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn test_wake_signal_wakes_waiter() {
        let signal = WakeSignal::new();
        let sender = signal.sender();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let _ = sender.send(());
        });
        let started = Instant::now();
        assert!(signal.await_for(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_wake_signal_times_out() {
        let signal = WakeSignal::new();
        assert!(!signal.await_for(Duration::from_millis(10)));
    }
}
