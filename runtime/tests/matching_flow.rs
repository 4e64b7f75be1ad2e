//! Integration tests for the per-partition matching flow.
//!
//! Drives an `Ingester` over the in-memory backends and asserts on store
//! state, anomaly records, quarantine contents, and stream cursors across
//! the interesting interleavings: duplicates on both streams, confirmation
//! before instruction, retry exhaustion under both policies, ambiguous
//! store timeouts, and store outages.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use chrono::TimeDelta;
use settlematch_core::anomaly::{AnomalyKind, AnomalySink};
use settlematch_core::key::{Key, PartitionId};
use settlematch_core::record::{Offset, RawRecord};
use settlematch_core::route::PartitionRouter;
use settlematch_core::store::{MatchState, MatchStore};
use settlematch_runtime::config::{ExhaustionPolicy, IngestConfig, KeyStrategy};
use settlematch_runtime::ingester::{DoneOutcome, Ingester, PendingOutcome, ReplayOutcome};
use settlematch_runtime::retry::RetryPolicy;
use settlematch_testing::{InMemoryAnomalySink, InMemoryMatchStore, ManualClock, StoreFault, VecRecordStream};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    ingester: Ingester,
    store: Arc<InMemoryMatchStore>,
    sink: Arc<InMemoryAnomalySink>,
    pending: Arc<VecRecordStream>,
    done: Arc<VecRecordStream>,
    clock: Arc<ManualClock>,
}

fn harness_with(config: &IngestConfig) -> Harness {
    let partition = PartitionId::new(0);
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(InMemoryMatchStore::new(clock.clone()));
    let sink = Arc::new(InMemoryAnomalySink::new());
    let pending = Arc::new(VecRecordStream::new(partition));
    let done = Arc::new(VecRecordStream::new(partition));

    let ingester = Ingester::new(
        partition,
        config,
        store.clone(),
        sink.clone(),
        pending.clone(),
        done.clone(),
        clock.clone(),
    );

    Harness {
        ingester,
        store,
        sink,
        pending,
        done,
        clock,
    }
}

fn harness() -> Harness {
    let config = IngestConfig::builder().build().unwrap();
    harness_with(&config)
}

fn payload(reference: &str) -> Vec<u8> {
    format!(r#"{{"reference":"{reference}"}}"#).into_bytes()
}

fn record(offset: u64, reference: &str) -> RawRecord {
    RawRecord::new(PartitionId::new(0), Offset::new(offset), payload(reference))
}

async fn state_of(store: &InMemoryMatchStore, key: &str) -> Option<MatchState> {
    store
        .get(Key::new(key))
        .await
        .unwrap()
        .map(|record| record.state)
}

#[tokio::test]
async fn instruction_then_confirmation_settles() {
    let mut h = harness();

    let outcome = h.ingester.process_pending(record(0, "INV-1")).await.unwrap();
    assert_eq!(outcome, PendingOutcome::Created);
    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Pending));

    let outcome = h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    assert_eq!(outcome, DoneOutcome::Transitioned);
    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Done));

    assert_eq!(h.pending.acked(), Some(Offset::new(0)));
    assert_eq!(h.done.acked(), Some(Offset::new(0)));
    assert_eq!(h.sink.total(), 0);
}

#[tokio::test]
async fn redelivered_instructions_apply_once() {
    let mut h = harness();

    let first = h.ingester.process_pending(record(0, "INV-1")).await.unwrap();
    assert_eq!(first, PendingOutcome::Created);

    for offset in 1..4 {
        let outcome = h
            .ingester
            .process_pending(record(offset, "INV-1"))
            .await
            .unwrap();
        assert_eq!(outcome, PendingOutcome::Duplicate);
    }

    assert_eq!(h.store.len(), 1);
    assert_eq!(h.sink.count(AnomalyKind::DuplicateInput), 3);
    let stored = h.store.get(Key::new("INV-1")).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(h.pending.acked(), Some(Offset::new(3)));
}

#[tokio::test]
async fn redelivered_confirmations_transition_once() {
    let mut h = harness();

    h.ingester.process_pending(record(0, "INV-1")).await.unwrap();
    let first = h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    assert_eq!(first, DoneOutcome::Transitioned);

    let second = h.ingester.process_done(record(1, "INV-1")).await.unwrap();
    assert_eq!(second, DoneOutcome::Duplicate);

    let stored = h.store.get(Key::new("INV-1")).await.unwrap().unwrap();
    assert_eq!(stored.state, MatchState::Done);
    assert_eq!(stored.version, 2);
    assert_eq!(h.sink.count(AnomalyKind::DuplicateOutput), 1);
    assert_eq!(h.done.acked(), Some(Offset::new(1)));
}

#[tokio::test]
async fn instruction_after_completion_never_reopens() {
    let mut h = harness();

    h.ingester.process_pending(record(0, "INV-1")).await.unwrap();
    h.ingester.process_done(record(0, "INV-1")).await.unwrap();

    let outcome = h.ingester.process_pending(record(1, "INV-1")).await.unwrap();
    assert_eq!(outcome, PendingOutcome::DuplicateAfterDone);

    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Done));
    assert_eq!(h.sink.count(AnomalyKind::DuplicateInputAfterDone), 1);
    assert_eq!(h.pending.acked(), Some(Offset::new(1)));
}

#[tokio::test]
async fn confirmation_before_instruction_parks_then_settles() {
    let mut h = harness();

    let outcome = h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    assert_eq!(outcome, DoneOutcome::Parked);
    assert_eq!(h.ingester.parked_retries(), 1);
    assert_eq!(h.sink.count(AnomalyKind::MissingInput), 1);
    assert_eq!(h.done.acked(), None);

    // The instruction catches up.
    h.ingester.process_pending(record(0, "INV-1")).await.unwrap();

    h.clock.advance(TimeDelta::minutes(1));
    let due = h.ingester.poll_parked().await.unwrap();
    assert_eq!(due, 1);

    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Done));
    assert_eq!(h.ingester.parked_retries(), 0);
    assert_eq!(h.done.acked(), Some(Offset::new(0)));
}

#[tokio::test]
async fn missing_input_retries_bump_one_anomaly_entry() {
    let retry = RetryPolicy::builder()
        .max_attempts(5)
        .initial_delay(Duration::from_millis(100))
        .build();
    let config = IngestConfig::builder().retry(retry).build().unwrap();
    let mut h = harness_with(&config);

    h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    for _ in 0..2 {
        h.clock.advance(TimeDelta::minutes(1));
        h.ingester.poll_parked().await.unwrap();
    }

    // One natural occurrence, three attempts so far.
    assert_eq!(h.sink.count(AnomalyKind::MissingInput), 1);
    let entry = &h.sink.anomalies()[0];
    assert_eq!(entry.attempt_count, 3);
    assert_eq!(h.ingester.parked_retries(), 1);
}

#[tokio::test]
async fn exhaustion_quarantines_and_acknowledges() {
    let retry = RetryPolicy::builder()
        .max_attempts(2)
        .initial_delay(Duration::from_millis(10))
        .build();
    let config = IngestConfig::builder()
        .retry(retry)
        .exhaustion_policy(ExhaustionPolicy::QuarantineAndAcknowledge)
        .build()
        .unwrap();
    let mut h = harness_with(&config);

    h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    h.clock.advance(TimeDelta::minutes(1));
    h.ingester.poll_parked().await.unwrap();

    assert_eq!(h.ingester.parked_retries(), 0);
    assert!(h.sink.is_quarantined(&Key::new("INV-1")));
    // The partition keeps moving under this policy.
    assert_eq!(h.done.acked(), Some(Offset::new(0)));
}

#[tokio::test]
async fn exhaustion_can_withhold_the_cursor() {
    let retry = RetryPolicy::builder()
        .max_attempts(2)
        .initial_delay(Duration::from_millis(10))
        .build();
    let config = IngestConfig::builder()
        .retry(retry)
        .exhaustion_policy(ExhaustionPolicy::QuarantineAndWithhold)
        .build()
        .unwrap();
    let mut h = harness_with(&config);

    h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    h.clock.advance(TimeDelta::minutes(1));
    h.ingester.poll_parked().await.unwrap();

    assert!(h.sink.is_quarantined(&Key::new("INV-1")));
    // Cursor held back: the stream will redeliver after a restart.
    assert_eq!(h.done.acked(), None);
}

#[tokio::test]
async fn duplicated_unmatched_confirmations_quarantine_without_a_record() {
    let retry = RetryPolicy::builder()
        .max_attempts(2)
        .initial_delay(Duration::from_millis(10))
        .build();
    let config = IngestConfig::builder().retry(retry).build().unwrap();
    let mut h = harness_with(&config);
    let key = Key::new("INV-1");

    // Two deliveries of the same confirmation, no instruction ever.
    h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    h.ingester.process_done(record(1, "INV-1")).await.unwrap();
    assert_eq!(h.ingester.parked_retries(), 2);
    // Distinct offsets are distinct occurrences.
    assert_eq!(h.sink.count(AnomalyKind::MissingInput), 2);

    h.clock.advance(TimeDelta::minutes(1));
    h.ingester.poll_parked().await.unwrap();

    // Both exhausted; re-quarantining the key replaced the earlier parked
    // record with the later delivery.
    assert_eq!(h.ingester.parked_retries(), 0);
    assert!(h.store.is_empty());
    let parked = h.sink.take_quarantined(&key).await.unwrap().unwrap();
    assert_eq!(parked.offset, Offset::new(1));
    // Acknowledge policy: the cursor moved past both deliveries.
    assert_eq!(h.done.acked(), Some(Offset::new(1)));
}

#[tokio::test]
async fn duplicated_unmatched_confirmations_withhold_the_cursor() {
    let retry = RetryPolicy::builder()
        .max_attempts(2)
        .initial_delay(Duration::from_millis(10))
        .build();
    let config = IngestConfig::builder()
        .retry(retry)
        .exhaustion_policy(ExhaustionPolicy::QuarantineAndWithhold)
        .build()
        .unwrap();
    let mut h = harness_with(&config);

    h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    h.ingester.process_done(record(1, "INV-1")).await.unwrap();
    h.clock.advance(TimeDelta::minutes(1));
    h.ingester.poll_parked().await.unwrap();

    assert!(h.store.is_empty());
    assert!(h.sink.is_quarantined(&Key::new("INV-1")));
    // Withhold policy: neither delivery is acknowledged.
    assert_eq!(h.done.acked(), None);
}

#[tokio::test]
async fn replay_completes_a_quarantined_confirmation() {
    let retry = RetryPolicy::builder()
        .max_attempts(2)
        .initial_delay(Duration::from_millis(10))
        .build();
    let config = IngestConfig::builder().retry(retry).build().unwrap();
    let mut h = harness_with(&config);
    let key = Key::new("INV-1");

    h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    h.clock.advance(TimeDelta::minutes(1));
    h.ingester.poll_parked().await.unwrap();
    assert!(h.sink.is_quarantined(&key));

    // Still no instruction: replay puts it straight back.
    assert_eq!(
        h.ingester.replay(&key).await.unwrap(),
        ReplayOutcome::StillMissing
    );
    assert!(h.sink.is_quarantined(&key));

    h.ingester.process_pending(record(0, "INV-1")).await.unwrap();
    assert_eq!(
        h.ingester.replay(&key).await.unwrap(),
        ReplayOutcome::Completed
    );
    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Done));
    assert!(!h.sink.is_quarantined(&key));

    assert_eq!(
        h.ingester.replay(&key).await.unwrap(),
        ReplayOutcome::NothingParked
    );
}

#[tokio::test]
async fn invalid_instruction_is_recorded_and_acknowledged() {
    let mut h = harness();
    let bad = RawRecord::new(PartitionId::new(0), Offset::new(0), b"not json".to_vec());

    let outcome = h.ingester.process_pending(bad).await.unwrap();
    assert_eq!(outcome, PendingOutcome::InvalidKey);

    assert!(h.store.is_empty());
    assert_eq!(h.sink.count(AnomalyKind::InvalidKey), 1);
    assert_eq!(h.pending.acked(), Some(Offset::new(0)));
}

#[tokio::test]
async fn invalid_confirmation_is_quarantined_without_ack() {
    let mut h = harness();
    let bad = RawRecord::new(PartitionId::new(0), Offset::new(0), b"not json".to_vec());

    let outcome = h.ingester.process_done(bad).await.unwrap();
    assert_eq!(outcome, DoneOutcome::InvalidKey);

    assert_eq!(h.sink.count(AnomalyKind::InvalidKey), 1);
    assert_eq!(h.sink.keyless_quarantine().len(), 1);
    assert_eq!(h.done.acked(), None);
}

#[tokio::test]
async fn withheld_confirmation_blocks_cursor_but_not_processing() {
    let mut h = harness();
    h.ingester.process_pending(record(0, "INV-1")).await.unwrap();

    // Offset 0 yields no key and stays unresolved; offset 1 settles INV-1.
    let bad = RawRecord::new(PartitionId::new(0), Offset::new(0), b"not json".to_vec());
    h.ingester.process_done(bad).await.unwrap();
    let outcome = h.ingester.process_done(record(1, "INV-1")).await.unwrap();
    assert_eq!(outcome, DoneOutcome::Transitioned);

    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Done));
    // The watermark cannot pass the withheld offset.
    assert_eq!(h.done.acked(), None);
}

#[tokio::test]
async fn ambiguous_create_resolved_as_applied() {
    let mut h = harness();

    h.store.inject_fault(StoreFault::TimeoutAfterApply);
    let outcome = h.ingester.process_pending(record(0, "INV-1")).await.unwrap();
    assert_eq!(outcome, PendingOutcome::AlreadyApplied);

    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Pending));
    assert_eq!(h.pending.acked(), Some(Offset::new(0)));
    // No false duplicate report from the resolution.
    assert_eq!(h.sink.total(), 0);
}

#[tokio::test]
async fn ambiguous_create_that_never_applied_is_redriven() {
    let mut h = harness();

    h.store.inject_fault(StoreFault::TimeoutBeforeApply);
    let result = h.ingester.process_pending(record(0, "INV-1")).await;
    assert!(result.is_err());
    assert!(h.store.is_empty());
    assert_eq!(h.pending.acked(), None);

    // Re-driving the same record applies it exactly once.
    let outcome = h.ingester.process_pending(record(0, "INV-1")).await.unwrap();
    assert_eq!(outcome, PendingOutcome::Created);
    assert_eq!(h.pending.acked(), Some(Offset::new(0)));
}

#[tokio::test]
async fn ambiguous_create_on_completed_key_reports_duplicate() {
    let mut h = harness();
    h.ingester.process_pending(record(0, "INV-1")).await.unwrap();
    h.ingester.process_done(record(0, "INV-1")).await.unwrap();

    // The timeout is ambiguous, but the re-read finds Done — which the
    // create cannot have produced, so this is a late resubmission.
    h.store.inject_fault(StoreFault::TimeoutBeforeApply);
    let outcome = h.ingester.process_pending(record(1, "INV-1")).await.unwrap();
    assert_eq!(outcome, PendingOutcome::DuplicateAfterDone);

    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Done));
    assert_eq!(h.sink.count(AnomalyKind::DuplicateInputAfterDone), 1);
    assert_eq!(h.pending.acked(), Some(Offset::new(1)));
}

#[tokio::test]
async fn ambiguous_transition_resolved_as_applied() {
    let mut h = harness();
    h.ingester.process_pending(record(0, "INV-1")).await.unwrap();

    h.store.inject_fault(StoreFault::TimeoutAfterApply);
    let outcome = h.ingester.process_done(record(0, "INV-1")).await.unwrap();
    assert_eq!(outcome, DoneOutcome::AlreadyApplied);

    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Done));
    assert_eq!(h.done.acked(), Some(Offset::new(0)));
    assert_eq!(h.sink.count(AnomalyKind::DuplicateOutput), 0);
}

#[tokio::test]
async fn store_outage_stashes_the_record_for_redrive() {
    let mut h = harness();
    h.pending.push(payload("INV-1"));

    h.store.inject_fault(StoreFault::Unavailable);
    let result = h.ingester.step().await;
    assert!(result.is_err());

    // Nothing applied, nothing acknowledged, nothing skipped.
    assert!(h.store.is_empty());
    assert_eq!(h.pending.acked(), None);
    assert_eq!(h.pending.remaining(), 0);

    // The stashed record is re-driven before anything newer.
    let progressed = h.ingester.step().await.unwrap();
    assert!(progressed);
    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Pending));
    assert_eq!(h.pending.acked(), Some(Offset::new(0)));
}

#[tokio::test]
async fn step_drains_both_streams_and_retries() {
    let mut h = harness();
    h.done.push(payload("INV-1"));

    // Confirmation first: parked.
    assert!(h.ingester.step().await.unwrap());
    assert_eq!(h.ingester.parked_retries(), 1);

    h.pending.push(payload("INV-1"));
    assert!(h.ingester.step().await.unwrap());

    h.clock.advance(TimeDelta::minutes(1));
    assert!(h.ingester.step().await.unwrap());
    assert_eq!(state_of(&h.store, "INV-1").await, Some(MatchState::Done));

    // Everything drained.
    assert!(!h.ingester.step().await.unwrap());
}

#[tokio::test]
async fn routing_agrees_across_streams_and_restarts() {
    let router = PartitionRouter::new(8);

    for reference in ["INV-1", "INV-2024-00017", "ACME/2024/17"] {
        let key = Key::new(reference);
        let first = router.route(&key);
        // Same key, same partition, regardless of which stream carried it
        // or how often routing runs.
        for _ in 0..3 {
            assert_eq!(router.route(&key), first);
        }
        assert!(first.value() < 8);
    }
}

mod interleaving_properties {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[derive(Copy, Clone, Debug)]
    enum Op {
        Pending(usize),
        Done(usize),
    }

    const KEYS: [&str; 3] = ["INV-A", "INV-B", "INV-C"];

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..KEYS.len()).prop_map(Op::Pending),
            (0..KEYS.len()).prop_map(Op::Done),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Under any interleaving of redeliveries and reorderings, each key
        /// transitions to Pending at most once and to Done at most once,
        /// and a completed key is never reopened.
        #[test]
        fn any_interleaving_settles_each_key_at_most_once(
            ops in prop::collection::vec(op_strategy(), 1..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async move {
                let retry = RetryPolicy::builder()
                    .max_attempts(10)
                    .initial_delay(Duration::from_millis(10))
                    .max_delay(Duration::from_secs(1))
                    .build();
                let config = IngestConfig::builder().retry(retry).build().unwrap();
                let mut h = harness_with(&config);

                let mut pending_seen = HashSet::new();
                let mut done_seen = HashSet::new();

                for (offset, op) in ops.iter().enumerate() {
                    let offset = u64::try_from(offset).unwrap();
                    match op {
                        Op::Pending(i) => {
                            pending_seen.insert(*i);
                            h.ingester.process_pending(record(offset, KEYS[*i])).await.unwrap();
                        }
                        Op::Done(i) => {
                            done_seen.insert(*i);
                            h.ingester.process_done(record(offset, KEYS[*i])).await.unwrap();
                        }
                    }
                }

                // Give every parked confirmation a chance to re-check now
                // that all instructions are in.
                for _ in 0..3 {
                    h.clock.advance(TimeDelta::minutes(1));
                    h.ingester.poll_parked().await.unwrap();
                }

                for (i, reference) in KEYS.iter().enumerate() {
                    let stored = h.store.get(Key::new(*reference)).await.unwrap();
                    match (pending_seen.contains(&i), done_seen.contains(&i)) {
                        (false, _) => {
                            // Never a record without an instruction.
                            prop_assert!(stored.is_none());
                        }
                        (true, false) => {
                            let stored = stored.unwrap();
                            prop_assert_eq!(stored.state, MatchState::Pending);
                            prop_assert_eq!(stored.version, 1);
                        }
                        (true, true) => {
                            let stored = stored.unwrap();
                            prop_assert_eq!(stored.state, MatchState::Done);
                            // Created once, transitioned once, never reopened.
                            prop_assert_eq!(stored.version, 2);
                        }
                    }
                }
                Ok(())
            })?;
        }
    }
}
