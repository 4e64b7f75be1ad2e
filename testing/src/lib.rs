//! # Settlematch Testing
//!
//! Testing utilities and in-memory backends for the Settlematch matching
//! engine.
//!
//! This crate provides:
//! - [`InMemoryMatchStore`]: `HashMap`-backed match store with fault injection
//! - [`InMemoryAnomalySink`]: capturing anomaly sink with a queryable quarantine
//! - [`VecRecordStream`]: in-memory stream partition with cursor tracking
//! - [`FixedClock`] / [`ManualClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use settlematch_testing::{InMemoryAnomalySink, InMemoryMatchStore, VecRecordStream};
//!
//! #[tokio::test]
//! async fn test_matching_flow() {
//!     let store = Arc::new(InMemoryMatchStore::default());
//!     let sink = Arc::new(InMemoryAnomalySink::new());
//!     let pending = Arc::new(VecRecordStream::new(PartitionId::new(0)));
//!     let done = Arc::new(VecRecordStream::new(PartitionId::new(0)));
//!
//!     pending.push(br#"{"reference":"INV-1"}"#.to_vec());
//!     done.push(br#"{"reference":"INV-1"}"#.to_vec());
//!
//!     // ... drive an Ingester over the mocks and assert on store/sink state
//! }
//! ```

/// Deterministic clocks for tests.
pub mod clock;

/// In-memory anomaly sink.
pub mod sink;

/// In-memory match store with fault injection.
pub mod store;

/// In-memory record stream.
pub mod stream;

// Re-export commonly used items
pub use clock::{FixedClock, ManualClock, test_clock, test_epoch};
pub use sink::InMemoryAnomalySink;
pub use store::{InMemoryMatchStore, StoreFault};
pub use stream::VecRecordStream;
