//! Backoff policy and the parked-retry schedule.
//!
//! A done record whose matching pending has not arrived is not an error to
//! crash on, and not something to block the partition for: it is parked with
//! a deadline and revisited later. This module provides the backoff policy
//! (capped exponential) and the deadline-ordered parked set the ingester
//! drains between records.
//!
//! # Example
//!
//! ```rust
//! use settlematch_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
//! ```

use chrono::{DateTime, Utc};
use settlematch_core::key::Key;
use settlematch_core::record::RawRecord;
use std::collections::BTreeMap;
use std::time::Duration;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts before the exhaustion policy applies
    pub max_attempts: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: Some(3),
            initial_delay: Some(Duration::from_millis(100)),
            max_delay: Some(Duration::from_secs(30)),
            multiplier: Some(2.0),
        }
    }

    /// Calculate delay for a given attempt number.
    ///
    /// Uses exponential backoff: delay = `initial_delay` * (multiplier ^ attempt),
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        #[allow(clippy::cast_possible_wrap)] // Attempt counts are small
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }

    /// Whether an attempt count has used up the budget.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retry attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            multiplier: self.multiplier.unwrap_or(2.0),
        }
    }
}

/// A done record parked for a later transition attempt.
#[derive(Debug, Clone)]
pub struct ParkedRetry {
    /// The key the record settles.
    pub key: Key,
    /// The record itself, replayed into the done path when due.
    pub record: RawRecord,
    /// Transition attempts made so far (the initial one included).
    pub attempts: u32,
}

/// Deadline-ordered set of parked done records.
///
/// Owned by a single partition worker, so no synchronization. Insertion
/// order breaks deadline ties, keeping drains deterministic.
#[derive(Debug, Default)]
pub struct ParkedRetries {
    entries: BTreeMap<(DateTime<Utc>, u64), ParkedRetry>,
    sequence: u64,
}

impl ParkedRetries {
    /// Create an empty parked set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an entry until `deadline`.
    pub fn park(&mut self, deadline: DateTime<Utc>, entry: ParkedRetry) {
        let seq = self.sequence;
        self.sequence += 1;
        self.entries.insert((deadline, seq), entry);
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<ParkedRetry> {
        let mut due = Vec::new();
        while let Some((&(deadline, seq), _)) = self.entries.iter().next() {
            if deadline > now {
                break;
            }
            if let Some(entry) = self.entries.remove(&(deadline, seq)) {
                due.push(entry);
            }
        }
        due
    }

    /// The earliest deadline currently parked, if any.
    ///
    /// The run loop sleeps until this instant when both streams are drained.
    #[must_use]
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Number of parked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the parked set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
