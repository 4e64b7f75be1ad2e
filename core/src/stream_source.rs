//! Record stream consumption contract.
//!
//! The matching engine consumes two independent record streams — pending and
//! done — through the [`RecordStream`] trait. Streams are ordered and
//! partitioned with at-least-once delivery: a record may be redelivered any
//! number of times until acknowledged, and the consumer tracks a durable
//! per-partition cursor.
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: records may arrive multiple times
//! - **Ordered within partition**: per-partition, per-stream FIFO
//! - **Ack after commit**: a record is acknowledged only after its store
//!   outcome is durably resolved; this conversion of at-least-once delivery
//!   into effectively-once state transitions is the engine's core guarantee
//! - **Opaque payloads**: the stream knows nothing about record contents

use crate::record::{Offset, RawRecord};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during stream operations.
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// Failed to connect to the stream.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to fetch the next record.
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Failed to advance the cursor.
    #[error("Acknowledgment failed at offset {offset}: {reason}")]
    AckFailed {
        /// The offset being acknowledged.
        offset: Offset,
        /// The reason for failure.
        reason: String,
    },
}

/// One partition of one ordered, at-least-once record stream.
///
/// An ingester holds two of these: its partition of the pending stream and
/// its partition of the done stream. The ingester is the exclusive owner of
/// this partition's cursor.
///
/// # Redelivery
///
/// `next` yields records in offset order. Records past the cursor may be
/// yielded again after a restart; consumers must be idempotent (the match
/// store's atomic operations make them so).
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns so the ingester can hold
/// `Arc<dyn RecordStream>`.
pub trait RecordStream: Send + Sync {
    /// Fetch the next unconsumed record, or `None` if the stream is
    /// currently drained.
    ///
    /// # Errors
    ///
    /// - [`StreamError::ConnectionFailed`] / [`StreamError::FetchFailed`]
    fn next(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RawRecord>, StreamError>> + Send + '_>>;

    /// Durably advance the cursor through `offset`.
    ///
    /// Must only be called after the record's store outcome (mutation or
    /// deliberate no-op) has committed. Acknowledging out of order is a
    /// contract violation; the cursor only moves forward.
    ///
    /// # Errors
    ///
    /// - [`StreamError::AckFailed`]
    fn ack(&self, offset: Offset)
    -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + '_>>;

    /// The last durably acknowledged offset, or `None` if nothing has been
    /// acknowledged yet.
    ///
    /// # Errors
    ///
    /// - [`StreamError::ConnectionFailed`]
    fn cursor(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Offset>, StreamError>> + Send + '_>>;
}
