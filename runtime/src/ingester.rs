//! Per-partition ingestion orchestrator.
//!
//! One [`Ingester`] owns one partition: it consumes that partition of the
//! pending stream and of the done stream, derives keys, drives the match
//! store's atomic operations, and acknowledges stream records only once
//! their store outcome is durably resolved. Exceptional per-record
//! conditions branch to the anomaly sink; a done record with no matching
//! pending is parked with a backoff deadline rather than blocking the
//! partition.
//!
//! # Acknowledgment discipline
//!
//! The cursor of each stream advances only through the contiguous prefix of
//! resolved records ([`AckTracker`]). A record is resolved when its store
//! mutation — or its deliberate no-op — has committed. Shutdown between
//! records therefore leaves either "committed and acknowledged" or
//! "neither": reprocessing after a restart is a harmless idempotent retry,
//! and the reverse (acknowledged without commit) cannot happen. A failed
//! cursor write is logged and left behind: the watermark is cumulative, so
//! a later acknowledgment covers it, and an unacknowledged-but-committed
//! record only ever reprocesses idempotently.
//!
//! # Interleaving
//!
//! Within the partition, each stream is processed in arrival order; no
//! ordering is assumed between the two streams. Done may precede, coincide
//! with, or trail pending arbitrarily — the state machine's outcomes, not
//! the arrival order, carry the semantics.

use crate::config::{ExhaustionPolicy, IngestConfig};
use crate::retry::{ParkedRetries, ParkedRetry, RetryPolicy};
use settlematch_core::anomaly::{Anomaly, AnomalyKind, AnomalySink, SinkError};
use settlematch_core::environment::Clock;
use settlematch_core::extract::KeyExtractor;
use settlematch_core::key::{Key, PartitionId};
use settlematch_core::record::{Offset, RawRecord, StreamKind};
use settlematch_core::store::{
    CreateOutcome, MatchState, MatchStore, StoreError, TransitionOutcome,
};
use settlematch_core::stream_source::{RecordStream, StreamError};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Errors that interrupt record processing.
///
/// These are conditions of the collaborators, not of the data: the record
/// being processed stays unresolved and is re-driven once the collaborator
/// recovers. Data-level conditions (duplicates, missing input, invalid
/// keys) never surface here.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The match store failed; the current record is re-driven later.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The anomaly sink failed; the current record is re-driven later.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The input stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Resolution of one pending-stream record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PendingOutcome {
    /// First sighting: a Pending record was created.
    Created,
    /// Key already Pending; idempotent no-op, `DuplicateInput` recorded.
    Duplicate,
    /// Key already Done; no mutation, `DuplicateInputAfterDone` recorded.
    DuplicateAfterDone,
    /// No key could be extracted; `InvalidKey` recorded, record dropped.
    InvalidKey,
    /// An ambiguous commit was resolved by re-read: the record is Pending,
    /// so the create is treated as applied. A re-read that finds Done
    /// resolves as [`PendingOutcome::DuplicateAfterDone`] instead — the
    /// create cannot have produced a Done record.
    AlreadyApplied,
}

/// Resolution of one done-stream record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DoneOutcome {
    /// The key moved Pending → Done.
    Transitioned,
    /// Key already Done; idempotent no-op, `DuplicateOutput` recorded.
    Duplicate,
    /// No matching pending yet; `MissingInput` recorded and the record
    /// parked for a backoff retry.
    Parked,
    /// No key could be extracted; `InvalidKey` recorded, record quarantined
    /// without acknowledgment (redelivery preserved).
    InvalidKey,
    /// An ambiguous commit was resolved by re-read: the key is Done, so the
    /// operation is treated as applied.
    AlreadyApplied,
}

/// Resolution of an operator-driven [`Ingester::replay`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The quarantined done record completed its key.
    Completed,
    /// The key was already Done; `DuplicateOutput` recorded.
    Duplicate,
    /// Still no matching pending; the record went back to quarantine.
    StillMissing,
    /// Nothing was quarantined under the key.
    NothingParked,
}

/// Tracks in-flight offsets of one stream and yields the acknowledgment
/// watermark.
///
/// Records enter when fetched and complete when their store outcome is
/// resolved. The watermark only advances through the contiguous completed
/// prefix, so a withheld record holds the cursor back even while later
/// records are processed.
#[derive(Debug, Default)]
struct AckTracker {
    inflight: BTreeMap<Offset, bool>,
}

impl AckTracker {
    fn begin(&mut self, offset: Offset) {
        self.inflight.entry(offset).or_insert(false);
    }

    /// Mark an offset resolved; returns the new watermark if the contiguous
    /// prefix advanced.
    fn complete(&mut self, offset: Offset) -> Option<Offset> {
        if let Some(resolved) = self.inflight.get_mut(&offset) {
            *resolved = true;
        }

        let mut watermark = None;
        while let Some((&head, &resolved)) = self.inflight.iter().next() {
            if !resolved {
                break;
            }
            self.inflight.remove(&head);
            watermark = Some(head);
        }
        watermark
    }
}

/// The per-partition orchestrator.
///
/// Exactly one instance should be active per partition at a time, but
/// correctness does not depend on that being perfectly enforced: during a
/// brief dual-ownership window (partition reassignment) both owners funnel
/// through the store's atomic create/compare-and-swap, and the loser of a
/// race merely observes a duplicate outcome.
pub struct Ingester {
    partition: PartitionId,
    extractor: Arc<dyn KeyExtractor>,
    store: Arc<dyn MatchStore>,
    sink: Arc<dyn AnomalySink>,
    clock: Arc<dyn Clock>,
    pending_stream: Arc<dyn RecordStream>,
    done_stream: Arc<dyn RecordStream>,
    retry: RetryPolicy,
    exhaustion: ExhaustionPolicy,
    idle_backoff: std::time::Duration,
    store_backoff: std::time::Duration,
    parked: ParkedRetries,
    pending_acks: AckTracker,
    done_acks: AckTracker,
    // A record whose processing hit a collaborator error is stashed here and
    // re-driven before anything newer is fetched, preserving per-stream FIFO.
    stalled_pending: Option<RawRecord>,
    stalled_done: Option<RawRecord>,
}

impl Ingester {
    /// Create the ingester for one partition.
    #[must_use]
    pub fn new(
        partition: PartitionId,
        config: &IngestConfig,
        store: Arc<dyn MatchStore>,
        sink: Arc<dyn AnomalySink>,
        pending_stream: Arc<dyn RecordStream>,
        done_stream: Arc<dyn RecordStream>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            partition,
            extractor: config.key_strategy.build(),
            store,
            sink,
            clock,
            pending_stream,
            done_stream,
            retry: config.retry.clone(),
            exhaustion: config.exhaustion,
            idle_backoff: config.idle_backoff,
            store_backoff: config.store_backoff,
            parked: ParkedRetries::new(),
            pending_acks: AckTracker::default(),
            done_acks: AckTracker::default(),
            stalled_pending: None,
            stalled_done: None,
        }
    }

    /// The partition this ingester owns.
    #[must_use]
    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Number of done records currently parked for retry.
    #[must_use]
    pub fn parked_retries(&self) -> usize {
        self.parked.len()
    }

    /// Process one pending-stream record.
    ///
    /// Every data-level outcome resolves and acknowledges the record; only a
    /// collaborator failure leaves it unresolved (and returns an error,
    /// after which the caller re-drives the same record).
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] when the store or sink failed before the
    /// record could be resolved.
    pub async fn process_pending(
        &mut self,
        record: RawRecord,
    ) -> Result<PendingOutcome, IngestError> {
        self.pending_acks.begin(record.offset);

        let key = match self.extractor.extract(&record, StreamKind::Pending) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(
                    partition = %self.partition,
                    offset = %record.offset,
                    %error,
                    "pending record yielded no key"
                );
                self.record_anomaly(None, AnomalyKind::InvalidKey, StreamKind::Pending, &record)
                    .await?;
                self.resolve_pending(record.offset).await;
                return Ok(PendingOutcome::InvalidKey);
            }
        };

        let outcome = match self.store.try_create(key.clone()).await {
            Ok(outcome) => outcome,
            Err(StoreError::Timeout { .. }) => {
                // Ambiguous commit: re-read before deciding anything.
                return self.resolve_pending_timeout(key, record).await;
            }
            Err(error) => return Err(error.into()),
        };

        match outcome {
            CreateOutcome::Created => {
                tracing::debug!(partition = %self.partition, %key, "pending created");
                metrics::counter!("settlematch.pending.created").increment(1);
                self.resolve_pending(record.offset).await;
                Ok(PendingOutcome::Created)
            }
            CreateOutcome::AlreadyExists(MatchState::Pending) => {
                self.record_anomaly(
                    Some(key),
                    AnomalyKind::DuplicateInput,
                    StreamKind::Pending,
                    &record,
                )
                .await?;
                self.resolve_pending(record.offset).await;
                Ok(PendingOutcome::Duplicate)
            }
            CreateOutcome::AlreadyExists(MatchState::Done) => {
                // Flagged for manual review; a completed key is never reopened.
                self.record_anomaly(
                    Some(key),
                    AnomalyKind::DuplicateInputAfterDone,
                    StreamKind::Pending,
                    &record,
                )
                .await?;
                self.resolve_pending(record.offset).await;
                Ok(PendingOutcome::DuplicateAfterDone)
            }
        }
    }

    /// Process one done-stream record.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] when the store or sink failed before the
    /// record could be resolved.
    pub async fn process_done(&mut self, record: RawRecord) -> Result<DoneOutcome, IngestError> {
        self.done_acks.begin(record.offset);

        let key = match self.extractor.extract(&record, StreamKind::Done) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(
                    partition = %self.partition,
                    offset = %record.offset,
                    %error,
                    "done record yielded no key, quarantining without ack"
                );
                self.record_anomaly(None, AnomalyKind::InvalidKey, StreamKind::Done, &record)
                    .await?;
                self.sink.quarantine(None, record).await?;
                // Deliberately unresolved: the cursor holds, redelivery preserved.
                return Ok(DoneOutcome::InvalidKey);
            }
        };

        let outcome = match self.store.try_transition(key.clone()).await {
            Ok(outcome) => outcome,
            Err(StoreError::Timeout { .. }) => {
                return self.resolve_done_timeout(key, record).await;
            }
            Err(error) => return Err(error.into()),
        };

        match outcome {
            TransitionOutcome::Transitioned => {
                tracing::debug!(partition = %self.partition, %key, "settled");
                metrics::counter!("settlematch.done.transitioned").increment(1);
                self.resolve_done(record.offset).await;
                Ok(DoneOutcome::Transitioned)
            }
            TransitionOutcome::WrongState(state) => {
                tracing::debug!(partition = %self.partition, %key, %state, "duplicate done");
                self.record_anomaly(
                    Some(key),
                    AnomalyKind::DuplicateOutput,
                    StreamKind::Done,
                    &record,
                )
                .await?;
                self.resolve_done(record.offset).await;
                Ok(DoneOutcome::Duplicate)
            }
            TransitionOutcome::NotFound => {
                self.record_anomaly(
                    Some(key.clone()),
                    AnomalyKind::MissingInput,
                    StreamKind::Done,
                    &record,
                )
                .await?;
                self.park_done(key, record, 1);
                Ok(DoneOutcome::Parked)
            }
        }
    }

    /// Re-attempt every parked done record whose backoff deadline passed.
    ///
    /// Returns the number of parked entries that were due. A parked record
    /// whose matching pending has since arrived completes here — this is the
    /// automatic re-check; operators only need [`Ingester::replay`] for
    /// records that already exhausted their budget.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Sink`] if the anomaly sink failed; the due
    /// entry and any entries behind it are re-parked first, so nothing is
    /// lost.
    pub async fn poll_parked(&mut self) -> Result<usize, IngestError> {
        let now = self.clock.now();
        let mut due: VecDeque<ParkedRetry> = self.parked.drain_due(now).into();
        let drained = due.len();

        while let Some(entry) = due.pop_front() {
            let snapshot = entry.clone();
            if let Err(error) = self.retry_parked(entry).await {
                self.repark_soon(snapshot);
                for rest in due {
                    self.repark_soon(rest);
                }
                return Err(error);
            }
        }
        Ok(drained)
    }

    async fn retry_parked(&mut self, entry: ParkedRetry) -> Result<(), IngestError> {
        let ParkedRetry {
            key,
            record,
            attempts,
        } = entry;

        let outcome = match self.store.try_transition(key.clone()).await {
            Ok(outcome) => outcome,
            Err(StoreError::Timeout { .. }) => {
                // Ambiguous: only count the retry as applied if the key is
                // observably Done.
                match self.store.get(key.clone()).await {
                    Ok(Some(stored)) if stored.state == MatchState::Done => {
                        self.resolve_done(record.offset).await;
                        return Ok(());
                    }
                    _ => {
                        self.repark_soon(ParkedRetry {
                            key,
                            record,
                            attempts,
                        });
                        return Ok(());
                    }
                }
            }
            Err(error) => {
                // Store trouble is not a data outcome; park again untouched.
                tracing::warn!(partition = %self.partition, %key, %error, "retry hit store error");
                self.repark_soon(ParkedRetry {
                    key,
                    record,
                    attempts,
                });
                return Ok(());
            }
        };

        match outcome {
            TransitionOutcome::Transitioned => {
                tracing::info!(partition = %self.partition, %key, attempts, "parked done settled");
                metrics::counter!("settlematch.done.transitioned").increment(1);
                metrics::counter!("settlematch.retry.recovered").increment(1);
                self.resolve_done(record.offset).await;
            }
            TransitionOutcome::WrongState(_) => {
                // Another delivery settled the key while this one was parked.
                self.record_anomaly(
                    Some(key),
                    AnomalyKind::DuplicateOutput,
                    StreamKind::Done,
                    &record,
                )
                .await?;
                self.resolve_done(record.offset).await;
            }
            TransitionOutcome::NotFound => {
                let attempts = attempts + 1;
                // Same natural occurrence: the sink bumps attempt_count.
                self.record_anomaly(
                    Some(key.clone()),
                    AnomalyKind::MissingInput,
                    StreamKind::Done,
                    &record,
                )
                .await?;

                if self.retry.is_exhausted(attempts) {
                    self.quarantine_exhausted(key, record).await?;
                } else {
                    metrics::counter!("settlematch.retry.parked").increment(1);
                    self.park_done(key, record, attempts);
                }
            }
        }
        Ok(())
    }

    async fn quarantine_exhausted(
        &mut self,
        key: Key,
        record: RawRecord,
    ) -> Result<(), IngestError> {
        tracing::warn!(
            partition = %self.partition,
            %key,
            policy = ?self.exhaustion,
            "missing-input retries exhausted, quarantining"
        );
        metrics::counter!("settlematch.retry.exhausted").increment(1);

        let offset = record.offset;
        self.sink.quarantine(Some(key), record).await?;

        match self.exhaustion {
            ExhaustionPolicy::QuarantineAndAcknowledge => {
                self.resolve_done(offset).await;
            }
            ExhaustionPolicy::QuarantineAndWithhold => {
                // Cursor stays put; the stream redelivers after restart until
                // an operator replays the key.
            }
        }
        Ok(())
    }

    /// Re-inject the quarantined done record for `key` into the done path.
    ///
    /// Used by operators (or automation) once the matching pending is known
    /// to have appeared.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] if the store or sink failed; the record is
    /// re-quarantined in that case.
    pub async fn replay(&mut self, key: &Key) -> Result<ReplayOutcome, IngestError> {
        let Some(record) = self.sink.take_quarantined(key).await? else {
            return Ok(ReplayOutcome::NothingParked);
        };

        match self.store.try_transition(key.clone()).await {
            Ok(TransitionOutcome::Transitioned) => {
                tracing::info!(partition = %self.partition, %key, "replayed done settled");
                metrics::counter!("settlematch.done.transitioned").increment(1);
                self.resolve_done(record.offset).await;
                Ok(ReplayOutcome::Completed)
            }
            Ok(TransitionOutcome::WrongState(_)) => {
                self.record_anomaly(
                    Some(key.clone()),
                    AnomalyKind::DuplicateOutput,
                    StreamKind::Done,
                    &record,
                )
                .await?;
                self.resolve_done(record.offset).await;
                Ok(ReplayOutcome::Duplicate)
            }
            Ok(TransitionOutcome::NotFound) => {
                self.sink.quarantine(Some(key.clone()), record).await?;
                Ok(ReplayOutcome::StillMissing)
            }
            Err(error) => {
                self.sink.quarantine(Some(key.clone()), record).await?;
                Err(error.into())
            }
        }
    }

    /// Drive the partition until `shutdown` flips to `true`.
    ///
    /// Retries due parked records, then interleaves both streams. When the
    /// store reports itself unavailable the current record is stashed and
    /// re-driven after a pause — never acknowledged, never skipped. Shutdown
    /// is only observed between records, so each record is either fully
    /// resolved or untouched.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                tracing::info!(partition = %self.partition, "ingester shut down");
                return;
            }

            match self.step().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        () = tokio::time::sleep(self.idle_backoff) => {}
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        partition = %self.partition,
                        %error,
                        "partition paused until collaborator recovers"
                    );
                    metrics::counter!("settlematch.partition.paused").increment(1);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        () = tokio::time::sleep(self.store_backoff) => {}
                    }
                }
            }
        }
    }

    /// One scheduling round: due retries, then at most one record from each
    /// stream. Returns whether any work was done.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] when a collaborator failed; the affected
    /// record is stashed and re-driven on the next call.
    pub async fn step(&mut self) -> Result<bool, IngestError> {
        let mut progressed = self.poll_parked().await? > 0;

        if let Some(record) = self.take_next_pending().await? {
            progressed = true;
            let stash = record.clone();
            if let Err(error) = self.process_pending(record).await {
                self.stalled_pending = Some(stash);
                return Err(error);
            }
        }

        if let Some(record) = self.take_next_done().await? {
            progressed = true;
            let stash = record.clone();
            if let Err(error) = self.process_done(record).await {
                self.stalled_done = Some(stash);
                return Err(error);
            }
        }

        Ok(progressed)
    }

    async fn take_next_pending(&mut self) -> Result<Option<RawRecord>, IngestError> {
        if let Some(record) = self.stalled_pending.take() {
            return Ok(Some(record));
        }
        Ok(self.pending_stream.next().await?)
    }

    async fn take_next_done(&mut self) -> Result<Option<RawRecord>, IngestError> {
        if let Some(record) = self.stalled_done.take() {
            return Ok(Some(record));
        }
        Ok(self.done_stream.next().await?)
    }

    fn park_done(&mut self, key: Key, record: RawRecord, attempts: u32) {
        let delay = self.retry.delay_for_attempt(attempts.saturating_sub(1));
        let deadline = self.clock.now()
            + chrono::TimeDelta::from_std(delay).unwrap_or_else(|_| chrono::TimeDelta::seconds(30));
        tracing::debug!(partition = %self.partition, %key, attempts, ?delay, "done parked");
        self.parked.park(
            deadline,
            ParkedRetry {
                key,
                record,
                attempts,
            },
        );
    }

    fn repark_soon(&mut self, entry: ParkedRetry) {
        let deadline = self.clock.now()
            + chrono::TimeDelta::from_std(self.store_backoff)
                .unwrap_or_else(|_| chrono::TimeDelta::seconds(1));
        self.parked.park(deadline, entry);
    }

    async fn resolve_pending_timeout(
        &mut self,
        key: Key,
        record: RawRecord,
    ) -> Result<PendingOutcome, IngestError> {
        match self.store.get(key.clone()).await? {
            Some(stored) if stored.state == MatchState::Done => {
                // A Done record cannot be this create's work, so the create
                // unambiguously did not apply: this is a resubmission after
                // completion and gets reported as one.
                self.record_anomaly(
                    Some(key),
                    AnomalyKind::DuplicateInputAfterDone,
                    StreamKind::Pending,
                    &record,
                )
                .await?;
                self.resolve_pending(record.offset).await;
                Ok(PendingOutcome::DuplicateAfterDone)
            }
            Some(_) => {
                // Pending is genuinely ambiguous: this worker or a redelivery
                // created it, either way the create is applied. No anomaly: a
                // false duplicate report would be worse than none.
                tracing::debug!(
                    partition = %self.partition,
                    %key,
                    "create timeout resolved as applied"
                );
                self.resolve_pending(record.offset).await;
                Ok(PendingOutcome::AlreadyApplied)
            }
            None => Err(StoreError::Timeout { key }.into()),
        }
    }

    async fn resolve_done_timeout(
        &mut self,
        key: Key,
        record: RawRecord,
    ) -> Result<DoneOutcome, IngestError> {
        match self.store.get(key.clone()).await? {
            Some(stored) if stored.state == MatchState::Done => {
                tracing::debug!(
                    partition = %self.partition,
                    %key,
                    "transition timeout resolved as applied"
                );
                self.resolve_done(record.offset).await;
                Ok(DoneOutcome::AlreadyApplied)
            }
            _ => Err(StoreError::Timeout { key }.into()),
        }
    }

    async fn record_anomaly(
        &self,
        key: Option<Key>,
        kind: AnomalyKind,
        stream: StreamKind,
        record: &RawRecord,
    ) -> Result<(), IngestError> {
        tracing::info!(
            partition = %self.partition,
            kind = %kind,
            stream = %stream,
            offset = %record.offset,
            key = key.as_ref().map_or("<none>", Key::as_str),
            "anomaly recorded"
        );
        metrics::counter!("settlematch.anomalies", "kind" => kind.as_str()).increment(1);

        let anomaly = Anomaly::from_record(key, kind, stream, record, self.clock.now());
        self.sink.record(anomaly).await?;
        Ok(())
    }

    async fn resolve_pending(&mut self, offset: Offset) {
        if let Some(watermark) = self.pending_acks.complete(offset) {
            if let Err(error) = self.pending_stream.ack(watermark).await {
                // Cursor-behind is the safe direction: a later ack covers
                // this watermark, and reprocessing is idempotent.
                tracing::warn!(partition = %self.partition, %watermark, %error, "pending ack failed");
            }
        }
    }

    async fn resolve_done(&mut self, offset: Offset) {
        if let Some(watermark) = self.done_acks.complete(offset) {
            if let Err(error) = self.done_stream.ack(watermark).await {
                tracing::warn!(partition = %self.partition, %watermark, %error, "done ack failed");
            }
        }
    }
}
