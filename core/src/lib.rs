//! # Settlematch Core
//!
//! Core traits and types for the Settlematch matching engine.
//!
//! Settlematch matches two independent streams of records — "pending"
//! payment instructions and "done" settlement confirmations — by key, so
//! that each logical payment is observed settled exactly once even though
//! the streams only guarantee at-least-once delivery.
//!
//! ## Core Concepts
//!
//! - **Key**: deterministic identifier derived from a record, stable across
//!   replays ([`key::Key`], derived by a [`extract::KeyExtractor`])
//! - **Partition**: consistently-hashed shard of the key space bounding
//!   ownership and transaction scope ([`route::PartitionRouter`])
//! - **Match Store**: transactional keyed store with atomic create and
//!   compare-and-swap, the system's only synchronization primitive
//!   ([`store::MatchStore`])
//! - **Anomaly Sink**: durable, append-only record of duplicates,
//!   mismatches, and invalid input, plus the replay quarantine
//!   ([`anomaly::AnomalySink`])
//! - **Record Stream**: ordered, partitioned, at-least-once input feed with
//!   an ack cursor ([`stream_source::RecordStream`])
//!
//! ## Architecture Principles
//!
//! - Expected steady-state results (duplicates, wrong state) are tagged
//!   outcome variants, never errors
//! - The two input streams are independent ordered channels; no cross-stream
//!   ordering is assumed anywhere
//! - Partition-scoped single-writer ownership plus store-level
//!   compare-and-swap instead of global locks
//! - Acknowledge only after the store outcome is durably resolved

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Anomaly taxonomy, anomaly sink contract, and replay quarantine.
pub mod anomaly;

/// Key extraction strategies (business fields or stream coordinates).
pub mod extract;

/// Key and partition identifier newtypes.
pub mod key;

/// Raw stream records and stream identification.
pub mod record;

/// Consistent key-to-partition routing.
pub mod route;

/// Match store trait, record types, and outcome variants.
pub mod store;

/// Record stream consumption contract.
pub mod stream_source;

/// Environment traits for injected dependencies.
///
/// All external dependencies of the pure core are abstracted behind traits
/// and injected, keeping the state machine deterministic under test.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// struct SystemClock;
    /// impl Clock for SystemClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         Utc::now()
    ///     }
    /// }
    ///
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// System clock - the production [`Clock`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
