//! Raw stream records and stream identification.
//!
//! A [`RawRecord`] is what the matching engine consumes from either input
//! stream: an opaque payload plus the stream coordinates (partition, offset)
//! it was delivered at. The engine never interprets the payload beyond what
//! the key extractor needs.

use crate::key::PartitionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which of the two input streams a record came from.
///
/// The pending stream carries payment instructions awaiting settlement; the
/// done stream carries settlement confirmations referencing a key. The two
/// streams are independent ordered channels — no cross-stream ordering is
/// ever assumed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Payment instructions awaiting settlement.
    Pending,
    /// Settlement confirmations, each referencing a key.
    Done,
}

impl StreamKind {
    /// Stable string form, used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position of a record within one partition of one stream.
///
/// Offsets are assigned by the stream, strictly increasing per partition.
/// The per-partition cursor is the offset of the last acknowledged record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset(u64);

impl Offset {
    /// Create a new `Offset` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the offset value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next offset (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Offset> for u64 {
    fn from(offset: Offset) -> Self {
        offset.0
    }
}

/// A record as delivered by one of the input streams.
///
/// The payload is opaque to the core; only the key extractor looks inside.
/// Stream coordinates are carried so the technical key strategy and the
/// acknowledgment path can reference them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Stream partition this record was delivered on.
    pub partition: PartitionId,

    /// Offset within the partition.
    pub offset: Offset,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl RawRecord {
    /// Create a new raw record.
    #[must_use]
    pub const fn new(partition: PartitionId, offset: Offset, payload: Vec<u8>) -> Self {
        Self {
            partition,
            offset,
            payload,
        }
    }

    /// Payload interpreted as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl fmt::Display for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawRecord {{ partition: {}, offset: {}, size: {} bytes }}",
            self.partition,
            self.offset,
            self.payload.len()
        )
    }
}
