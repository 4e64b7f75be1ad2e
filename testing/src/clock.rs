//! Deterministic clocks for tests.

use chrono::{DateTime, TimeDelta, Utc};
use settlematch_core::environment::Clock;
use std::sync::Mutex;

/// Fixed clock for deterministic tests
///
/// Always returns the same time, making tests reproducible.
///
/// # Example
///
/// ```
/// use settlematch_testing::FixedClock;
/// use settlematch_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// let time1 = clock.now();
/// let time2 = clock.now();
/// assert_eq!(time1, time2); // Always the same!
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Manually advanced clock for retry-deadline tests.
///
/// Starts at a fixed instant and only moves when the test says so, which
/// makes backoff deadlines land deterministically.
#[derive(Debug)]
pub struct ManualClock {
    time: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(test_epoch())
    }
}

impl ManualClock {
    /// Create a manual clock starting at the given time.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Mutex::new(time),
        }
    }

    /// Advance the clock by a delta.
    pub fn advance(&self, delta: TimeDelta) {
        #[allow(clippy::unwrap_used)] // Mutex poisoning only follows a panicked test
        let mut time = self.time.lock().unwrap();
        *time += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        #[allow(clippy::unwrap_used)] // Mutex poisoning only follows a panicked test
        *self.time.lock().unwrap()
    }
}

/// Default test instant (2025-01-01 00:00:00 UTC)
///
/// # Panics
///
/// This function will panic if the hardcoded timestamp fails to parse,
/// which should never happen in practice.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
        .expect("hardcoded timestamp should always parse")
        .with_timezone(&Utc)
}

/// Create a default fixed clock for tests
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(test_epoch())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_never_moves() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_advances_on_demand() {
        let clock = ManualClock::default();
        let start = clock.now();

        clock.advance(TimeDelta::seconds(30));
        assert_eq!(clock.now(), start + TimeDelta::seconds(30));
    }
}
