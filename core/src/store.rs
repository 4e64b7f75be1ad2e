//! Match store trait and related types.
//!
//! This module defines the core abstraction for the match store - a
//! transactional keyed store tracking the settlement state of each logical
//! payment with atomic create and compare-and-swap operations.
//!
//! # Design
//!
//! The `MatchStore` trait is deliberately minimal and focused. It provides
//! exactly what the matching state machine needs:
//!
//! - Atomic create of a Pending record iff the key is unseen
//! - Atomic compare-and-swap of Pending → Done
//! - Read-your-writes lookup by key
//! - Age-based scan for operational queries
//!
//! Expected steady-state results (duplicate create, wrong-state transition)
//! are modeled as tagged outcome variants, not errors: they are the normal
//! vocabulary of an at-least-once world. Errors are reserved for the store
//! itself misbehaving.
//!
//! # Implementations
//!
//! - `PostgresMatchStore` (in `settlematch-postgres` crate): Production implementation
//! - `InMemoryMatchStore` (in `settlematch-testing` crate): Fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use settlematch_core::store::{CreateOutcome, MatchStore, StoreError, TransitionOutcome};
//! use settlematch_core::key::Key;
//!
//! async fn example<S: MatchStore>(store: &S) -> Result<(), StoreError> {
//!     let key = Key::new("INV-2024-00017");
//!
//!     match store.try_create(key.clone()).await? {
//!         CreateOutcome::Created => { /* first sighting */ }
//!         CreateOutcome::AlreadyExists(state) => { /* duplicate, state tells which kind */ }
//!     }
//!
//!     match store.try_transition(key).await? {
//!         TransitionOutcome::Transitioned => { /* settled */ }
//!         TransitionOutcome::NotFound => { /* done arrived before pending */ }
//!         TransitionOutcome::WrongState(_) => { /* already settled */ }
//!     }
//!
//!     Ok(())
//! }
//! ```

use crate::key::Key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Settlement state of one logical payment.
///
/// State is monotonic: `Pending` → `Done`, never back. A completed key is
/// never reopened by the core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchState {
    /// Instruction seen, confirmation not yet matched.
    Pending,
    /// Confirmation matched; terminal.
    Done,
}

impl MatchState {
    /// Stable string form, used in storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
        }
    }

    /// Parse state from its storage string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the string doesn't match a known state.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            _ => Err(StoreError::Backend(format!("invalid match state: {s}"))),
        }
    }
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The stored record for one key.
///
/// At most one record exists per key; the store is its sole owner. Records
/// are never deleted by the core (retention is an external concern).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// The key this record tracks.
    pub key: Key,

    /// Current settlement state.
    pub state: MatchState,

    /// When the record was created (first pending sighting).
    pub created_at: DateTime<Utc>,

    /// When the record last changed state.
    pub updated_at: DateTime<Utc>,

    /// Optimistic-concurrency version, incremented on every committed mutation.
    pub version: u64,
}

/// Result of [`MatchStore::try_create`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A Pending record was inserted for the key.
    Created,
    /// A record already existed; carries its current state so the caller can
    /// distinguish a pending-duplicate from a resubmission after completion.
    AlreadyExists(MatchState),
}

/// Result of [`MatchStore::try_transition`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The record moved Pending → Done.
    Transitioned,
    /// No record exists for the key (confirmation before instruction).
    NotFound,
    /// The record exists but is not Pending; carries the observed state.
    WrongState(MatchState),
}

/// Errors that can occur during match store operations.
///
/// These describe the store failing, not the data disagreeing — disagreement
/// is expressed through [`CreateOutcome`] and [`TransitionOutcome`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store is unreachable or refusing work.
    ///
    /// This is a blocking condition: the partition worker must pause (no
    /// acknowledgment, no skipping) until the store recovers.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The operation timed out with an unknown outcome.
    ///
    /// An ambiguous commit: the mutation may or may not have applied. The
    /// caller must re-`get` the key before any retry decision to avoid
    /// double application.
    #[error("Store operation timed out for key {key}")]
    Timeout {
        /// The key whose operation outcome is unknown.
        key: Key,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend-specific failure (connection, query, constraint).
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Transactional keyed store tracking match state per key.
///
/// # Atomicity
///
/// Each operation is atomic with respect to concurrent callers on the same
/// key. All mutation goes through `try_create` / `try_transition`; no
/// caller-side read-then-write sequence is ever correct against this trait.
/// This is the only synchronization primitive the system relies on — even a
/// brief dual-ownership window during partition reassignment cannot corrupt
/// state, because both owners funnel through the same compare-and-swap.
///
/// # Consistency
///
/// `get` must reflect every prior commit made through the same store
/// instance (read-your-writes). `scan` needs no cross-key consistency.
///
/// # Sharding
///
/// The store may be sharded by partition; keys are routed consistently to
/// one partition, so no cross-shard transaction is ever required.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` to enable trait object usage (`Arc<dyn MatchStore>`), which is
/// how the ingester holds its store.
pub trait MatchStore: Send + Sync {
    /// Atomically insert a Pending record iff none exists for `key`.
    ///
    /// # Returns
    ///
    /// - [`CreateOutcome::Created`] if the record was inserted
    /// - [`CreateOutcome::AlreadyExists`] with the current state otherwise
    ///
    /// No partial application is possible: either the record exists after
    /// the call, or the call failed with an error.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unavailable`]: store down, caller must pause
    /// - [`StoreError::Timeout`]: ambiguous, caller must re-`get` first
    /// - [`StoreError::Backend`]: backend failure
    fn try_create(
        &self,
        key: Key,
    ) -> Pin<Box<dyn Future<Output = Result<CreateOutcome, StoreError>> + Send + '_>>;

    /// Atomic compare-and-swap: Pending → Done.
    ///
    /// Succeeds only if the stored state is currently Pending.
    ///
    /// # Returns
    ///
    /// - [`TransitionOutcome::Transitioned`] on success
    /// - [`TransitionOutcome::NotFound`] if no record exists for the key
    /// - [`TransitionOutcome::WrongState`] if the record is not Pending
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`MatchStore::try_create`].
    fn try_transition(
        &self,
        key: Key,
    ) -> Pin<Box<dyn Future<Output = Result<TransitionOutcome, StoreError>> + Send + '_>>;

    /// Look up the record for a key.
    ///
    /// Must reflect every commit made through this store instance before the
    /// call returns. This is what makes ambiguous-timeout resolution sound:
    /// re-reading after a timeout tells the caller whether the mutation
    /// applied.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unavailable`] / [`StoreError::Backend`]
    fn get(
        &self,
        key: Key,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MatchRecord>, StoreError>> + Send + '_>>;

    /// Scan records by state and age.
    ///
    /// Supports operational queries such as "Pending older than T" (aged
    /// unmatched instructions). Results carry no cross-key transactional
    /// consistency guarantee.
    ///
    /// # Parameters
    ///
    /// - `state`: restrict to records in this state, or `None` for all
    /// - `older_than`: restrict to records not updated since this instant,
    ///   or `None` for all
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unavailable`] / [`StoreError::Backend`]
    fn scan(
        &self,
        state: Option<MatchState>,
        older_than: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MatchRecord>, StoreError>> + Send + '_>>;
}
