//! Anomaly taxonomy and the anomaly sink contract.
//!
//! Every exceptional per-record condition the matching engine observes is
//! appended to the anomaly sink: duplicates, mismatches, invalid input.
//! Anomalies are operator-facing data, not control flow — most of them are
//! expected steady-state events in an at-least-once world. The sink also
//! holds the quarantine: done records that could not be applied and are
//! parked for manual or automatic replay.

use crate::key::{Key, PartitionId};
use crate::record::{Offset, RawRecord, StreamKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Classification of an observed anomaly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    /// A record did not yield a usable key.
    InvalidKey,
    /// A pending record arrived for a key already Pending.
    DuplicateInput,
    /// A pending record arrived for a key already Done. Flagged for manual
    /// review; a completed key is never reopened.
    DuplicateInputAfterDone,
    /// A done record arrived for a key already Done.
    DuplicateOutput,
    /// A done record arrived with no matching pending record.
    MissingInput,
    /// A Pending record aged past a threshold with no Done. Visibility only,
    /// surfaced through the age-based scan rather than recorded by the
    /// ingester.
    MissingOutput,
}

impl AnomalyKind {
    /// Stable string form, used in storage and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid_key",
            Self::DuplicateInput => "duplicate_input",
            Self::DuplicateInputAfterDone => "duplicate_input_after_done",
            Self::DuplicateOutput => "duplicate_output",
            Self::MissingInput => "missing_input",
            Self::MissingOutput => "missing_output",
        }
    }

    /// Parse a kind from its storage string.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Backend`] if the string doesn't match a known kind.
    pub fn parse(s: &str) -> Result<Self, SinkError> {
        match s {
            "invalid_key" => Ok(Self::InvalidKey),
            "duplicate_input" => Ok(Self::DuplicateInput),
            "duplicate_input_after_done" => Ok(Self::DuplicateInputAfterDone),
            "duplicate_output" => Ok(Self::DuplicateOutput),
            "missing_input" => Ok(Self::MissingInput),
            "missing_output" => Ok(Self::MissingOutput),
            _ => Err(SinkError::Backend(format!("invalid anomaly kind: {s}"))),
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One appended anomaly entry.
///
/// Entries are append-only; the only in-place mutation the sink performs is
/// incrementing `attempt_count` when the same natural occurrence is recorded
/// again (retry of a parked done record, or redelivery of the same input).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    /// The key involved, if one could be extracted.
    pub key: Option<Key>,

    /// Classification of the condition.
    pub kind: AnomalyKind,

    /// Stream the triggering record came from, if any.
    pub stream: Option<StreamKind>,

    /// Partition the triggering record was delivered on, if any. Offsets are
    /// only meaningful per partition, so this is part of the occurrence
    /// identity.
    pub partition: Option<PartitionId>,

    /// Offset of the triggering record, if any. Together with `kind`,
    /// `stream`, and `partition` this identifies the natural occurrence for
    /// idempotent recording.
    pub offset: Option<Offset>,

    /// The raw payload that triggered the anomaly.
    pub raw_payload: Vec<u8>,

    /// When the anomaly was first observed.
    pub observed_at: DateTime<Utc>,

    /// How many times this occurrence has been observed or retried.
    pub attempt_count: u32,
}

impl Anomaly {
    /// Build an anomaly from the record that triggered it.
    #[must_use]
    pub fn from_record(
        key: Option<Key>,
        kind: AnomalyKind,
        stream: StreamKind,
        record: &RawRecord,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            kind,
            stream: Some(stream),
            partition: Some(record.partition),
            offset: Some(record.offset),
            raw_payload: record.payload.clone(),
            observed_at,
            attempt_count: 1,
        }
    }
}

/// Errors that can occur during anomaly sink operations.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink is unreachable or refusing work.
    #[error("Anomaly sink unavailable: {0}")]
    Unavailable(String),

    /// Backend-specific failure (connection, query, constraint).
    #[error("Anomaly sink backend error: {0}")]
    Backend(String),
}

/// Durable, append-only record of anomalies plus the replay quarantine.
///
/// # Idempotency
///
/// `record` is idempotent per natural occurrence: recording the same
/// `(kind, stream, partition, offset)` again increments the existing
/// entry's `attempt_count` instead of appending a second entry.
///
/// # Quarantine
///
/// Done records that exhausted their retry budget (or carried no usable
/// key) are parked here. `take_quarantined` removes and returns the parked
/// record for a key so the ingester's `replay` can re-inject it into the
/// done path.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns so the ingester can hold
/// `Arc<dyn AnomalySink>`.
pub trait AnomalySink: Send + Sync {
    /// Append an anomaly, or bump the attempt count of the same occurrence.
    ///
    /// # Errors
    ///
    /// - [`SinkError::Unavailable`] / [`SinkError::Backend`]
    fn record(
        &self,
        anomaly: Anomaly,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>>;

    /// Query recorded anomalies, optionally filtered by kind and age.
    ///
    /// `older_than` restricts to entries first observed before the given
    /// instant. Results are ordered oldest first.
    ///
    /// # Errors
    ///
    /// - [`SinkError::Unavailable`] / [`SinkError::Backend`]
    fn query(
        &self,
        kind: Option<AnomalyKind>,
        older_than: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Anomaly>, SinkError>> + Send + '_>>;

    /// Park a done record for later replay.
    ///
    /// Parking the same key again replaces the previous parked record (the
    /// payloads are identical deliveries of the same confirmation).
    ///
    /// # Errors
    ///
    /// - [`SinkError::Unavailable`] / [`SinkError::Backend`]
    fn quarantine(
        &self,
        key: Option<Key>,
        record: RawRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>>;

    /// Remove and return the quarantined done record for a key, if any.
    ///
    /// # Errors
    ///
    /// - [`SinkError::Unavailable`] / [`SinkError::Backend`]
    fn take_quarantined(
        &self,
        key: &Key,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RawRecord>, SinkError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in &[
            AnomalyKind::InvalidKey,
            AnomalyKind::DuplicateInput,
            AnomalyKind::DuplicateInputAfterDone,
            AnomalyKind::DuplicateOutput,
            AnomalyKind::MissingInput,
            AnomalyKind::MissingOutput,
        ] {
            let s = kind.as_str();
            #[allow(clippy::expect_used)] // Panics: Test will fail if parse fails
            let parsed = AnomalyKind::parse(s).expect("valid kind should parse");
            assert_eq!(*kind, parsed);
        }
    }

    #[test]
    fn kind_invalid() {
        assert!(AnomalyKind::parse("weird").is_err());
    }

    #[test]
    fn from_record_captures_occurrence_identity() {
        let record = RawRecord::new(PartitionId::new(1), Offset::new(9), b"x".to_vec());
        let anomaly = Anomaly::from_record(
            Some(Key::new("INV-1")),
            AnomalyKind::DuplicateOutput,
            StreamKind::Done,
            &record,
            Utc::now(),
        );

        assert_eq!(anomaly.stream, Some(StreamKind::Done));
        assert_eq!(anomaly.partition, Some(PartitionId::new(1)));
        assert_eq!(anomaly.offset, Some(Offset::new(9)));
        assert_eq!(anomaly.attempt_count, 1);
        assert_eq!(anomaly.raw_payload, b"x".to_vec());
    }
}
