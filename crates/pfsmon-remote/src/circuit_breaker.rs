//! Per-host circuit breaker
//!
//! After a run of consecutive connect failures a host is fenced off: calls
//! to it fail fast instead of burning a worker slot on a connect timeout.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Host reachable, calls allowed
    Closed,
    /// Too many connect failures, calls rejected
    Open,
    /// Cool-down elapsed, a trial call is allowed
    HalfOpen,
}

/// Circuit breaker for one host
///
/// ```
/// use pfsmon_remote::CircuitBreaker;
///
/// let cb = CircuitBreaker::new(3, 60);
/// cb.record_failure();
/// cb.record_failure();
/// cb.record_failure();
/// assert!(!cb.can_execute());
/// ```
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    last_failure: AtomicU64, // Unix timestamp millis
    threshold: u32,
    cooldown: Duration,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl CircuitBreaker {
    /// `threshold` consecutive failures open the circuit for `cooldown_secs`
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self::with_cooldown(threshold, Duration::from_secs(cooldown_secs))
    }

    pub fn with_cooldown(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.failure_count.load(Ordering::Relaxed) < self.threshold {
            return CircuitState::Closed;
        }

        let elapsed = now_millis().saturating_sub(self.last_failure.load(Ordering::Relaxed));
        if elapsed >= self.cooldown.as_millis() as u64 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// The host answered; close the circuit
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(now_millis(), Ordering::Relaxed);
    }

    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Milliseconds until a trial call is allowed, 0 if not open
    pub fn time_until_retry(&self) -> u64 {
        match self.state() {
            CircuitState::Open => {
                let elapsed =
                    now_millis().saturating_sub(self.last_failure.load(Ordering::Relaxed));
                (self.cooldown.as_millis() as u64).saturating_sub(elapsed)
            }
            _ => 0,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, 60)
    }
}
