//! Retry backoff policy.
//!
//! The policy is a pure function of the attempt count. It only answers "how
//! long until the job is eligible again"; the store turns that into a
//! `next_attempt_at` timestamp and the worker never sleeps on it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Default exponent base.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Default delay unit (one second).
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Exponential backoff: `unit * base ^ attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    base: u32,
    unit: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy. `base` must be greater than 1 and `unit` non-zero,
    /// otherwise delays would not grow with the attempt count.
    pub fn new(base: u32, unit: Duration) -> Result<Self, DomainError> {
        if base < 2 {
            return Err(DomainError::validation(format!(
                "backoff base must be greater than 1, got {base}"
            )));
        }
        if unit.is_zero() {
            return Err(DomainError::validation("backoff unit must be non-zero"));
        }
        Ok(Self { base, unit })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// Delay before the next attempt, given the attempt count **after** the
    /// failed attempt was recorded (first failure passes 1).
    ///
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = match (self.base as u128).checked_pow(attempts) {
            Some(f) => f,
            None => return Duration::MAX,
        };
        let nanos = match self.unit.as_nanos().checked_mul(factor) {
            Some(n) => n,
            None => return Duration::MAX,
        };
        let secs = nanos / 1_000_000_000;
        if secs > u64::MAX as u128 {
            return Duration::MAX;
        }
        Duration::new(secs as u64, (nanos % 1_000_000_000) as u32)
    }

    /// Absolute time at which a job that just reached `attempts` becomes
    /// eligible again.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
