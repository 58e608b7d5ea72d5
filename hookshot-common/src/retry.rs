//! # Retry
//!
//! The two retry schedules used for deliveries: a polynomial `RetryPolicy` spacing out the
//! in-process resubmissions of the immediate phase, and the fixed delay table consulted once a
//! delivery has moved to the scheduled phase.
use std::time;

use chrono::{DateTime, Utc};

/// Upper bound on attempts for a single delivery, across both phases.
pub const MAX_TOTAL_ATTEMPTS: i32 = 10;

/// Attempt count at which a failing delivery leaves the immediate phase.
pub const IMMEDIATE_MAX_ATTEMPTS: i32 = 5;

/// Delay before the next scheduled attempt, indexed by the number of attempts already made.
pub const RETRY_SCHEDULE: [time::Duration; 10] = [
    time::Duration::from_secs(30),
    time::Duration::from_secs(2 * 60),
    time::Duration::from_secs(5 * 60),
    time::Duration::from_secs(15 * 60),
    time::Duration::from_secs(30 * 60),
    time::Duration::from_secs(60 * 60),
    time::Duration::from_secs(2 * 60 * 60),
    time::Duration::from_secs(4 * 60 * 60),
    time::Duration::from_secs(8 * 60 * 60),
    time::Duration::from_secs(24 * 60 * 60),
];

/// Look up the scheduled-phase delay for a delivery that has made `attempts` attempts.
/// Counts past the end of the table reuse its last entry.
pub fn scheduled_delay(attempts: i32) -> time::Duration {
    let index = usize::try_from(attempts.max(0)).unwrap_or(usize::MAX);
    RETRY_SCHEDULE
        .get(index)
        .copied()
        .unwrap_or(RETRY_SCHEDULE[RETRY_SCHEDULE.len() - 1])
}

/// When the next scheduled attempt is due, or `None` once no attempts remain.
pub fn next_attempt_at(attempts: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if attempts >= MAX_TOTAL_ATTEMPTS {
        return None;
    }

    let delay = chrono::Duration::from_std(scheduled_delay(attempts)).ok()?;
    now.checked_add_signed(delay)
}

#[derive(Clone, Debug)]
/// Backoff between automatic resubmissions in the immediate phase.
///
/// The interval after attempt `n` is `unit * n^exponent + base_interval`, capped by
/// `maximum_interval` when set.
pub struct RetryPolicy {
    /// Power applied to the attempt number.
    pub exponent: u32,
    /// Duration multiplied by `attempt^exponent`.
    pub unit: time::Duration,
    /// Constant added to every interval.
    pub base_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(exponent: u32, unit: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(exponent, unit)
    }

    /// Determine the interval to wait after the given attempt number failed.
    pub fn retry_interval(&self, attempt: i32) -> time::Duration {
        let attempt = u32::try_from(attempt.max(1)).unwrap_or(1);
        let factor = attempt.saturating_pow(self.exponent);
        let candidate_interval = self
            .unit
            .checked_mul(factor)
            .and_then(|interval| interval.checked_add(self.base_interval))
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub exponent: u32,
    pub unit: time::Duration,
    pub base_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            exponent: 4,
            unit: time::Duration::from_secs(1),
            base_interval: time::Duration::from_secs(2),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(exponent: u32, unit: time::Duration) -> Self {
        Self {
            exponent,
            unit,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn base_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.base_interval = interval;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            exponent: self.exponent,
            unit: self.unit,
            base_interval: self.base_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
