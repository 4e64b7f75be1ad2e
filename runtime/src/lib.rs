//! # Settlematch Runtime
//!
//! Runtime implementation for the Settlematch matching engine.
//!
//! This crate provides the per-partition [`ingester::Ingester`] that turns
//! at-least-once stream traffic into exactly-once-observed state
//! transitions, plus the retry scheduling and configuration it needs.
//!
//! ## Core Components
//!
//! - **Ingester**: one per partition; consumes both streams, drives the
//!   match store's atomic operations, acknowledges after commit
//! - **Parked retries**: deadline-ordered backoff schedule for done records
//!   whose matching pending has not arrived yet
//! - **Config**: key strategy, partition count, retry budget, exhaustion
//!   policy
//!
//! ## Example
//!
//! ```ignore
//! use settlematch_runtime::config::IngestConfig;
//! use settlematch_runtime::ingester::Ingester;
//!
//! let config = IngestConfig::builder().partitions(8).build()?;
//! let mut ingester = Ingester::new(
//!     partition, &config, store, sink, pending_stream, done_stream, clock,
//! );
//!
//! // Drive the partition until shutdown flips.
//! ingester.run(shutdown_rx).await;
//! ```

/// Runtime configuration surface (key strategy, retries, exhaustion policy).
pub mod config;

/// Per-partition ingestion orchestrator.
pub mod ingester;

/// Backoff policy and the parked-retry schedule.
pub mod retry;

pub use config::{ExhaustionPolicy, IngestConfig, KeyStrategy};
pub use ingester::{DoneOutcome, IngestError, Ingester, PendingOutcome, ReplayOutcome};
pub use retry::RetryPolicy;
