//! Retry policies and backoff shapes
//!
//! Retries are expressed as explicit policy objects per step kind rather
//! than ad hoc loops at call sites. The same backoff shape is reused by the
//! agent liveness poller and the metric sink writer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::catalog::StepKind;

/// Bounded retry policy for one kind of install step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis((delay as u64).min(self.max_backoff_ms))
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
        .with_multiplier(self.multiplier)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Retry policy for every retryable step kind
///
/// Verify steps never retry, so there is no `[retry.verify]` section and
/// unknown sections are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicies {
    #[serde(default)]
    pub push: RetryPolicy,
    #[serde(default)]
    pub command: RetryPolicy,
    #[serde(default)]
    pub service_start: RetryPolicy,
}

impl RetryPolicies {
    pub fn for_kind(&self, kind: StepKind) -> RetryPolicy {
        match kind {
            StepKind::Push => self.push,
            StepKind::Command => self.command,
            StepKind::ServiceStart => self.service_start,
            // Verification failures are never retried
            StepKind::Verify => RetryPolicy::no_retry(),
        }
    }

    /// Same policy for every retryable kind (handy in tests)
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            push: policy,
            command: policy,
            service_start: policy,
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            push: RetryPolicy::default(),
            command: RetryPolicy::default(),
            service_start: RetryPolicy::default(),
        }
    }
}

/// Stateful exponential backoff: each `next_delay` grows by the multiplier
/// until the cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier: 2.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Return the next delay and advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        let next = (self.current.as_nanos() as f64 * self.multiplier) as u64;
        self.current = Duration::from_nanos(next).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
