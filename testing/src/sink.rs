//! In-memory anomaly sink with a queryable quarantine.

use settlematch_core::anomaly::{Anomaly, AnomalyKind, AnomalySink, SinkError};
use settlematch_core::key::Key;
use settlematch_core::record::RawRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    anomalies: Vec<Anomaly>,
    quarantined: HashMap<Key, RawRecord>,
    keyless_quarantine: Vec<RawRecord>,
}

/// Vec-backed [`AnomalySink`] capturing everything for assertions.
///
/// Recording is idempotent per natural occurrence: re-recording the same
/// `(kind, stream, partition, offset)` bumps the existing entry's `attempt_count`
/// instead of appending.
#[derive(Default)]
pub struct InMemoryAnomalySink {
    inner: Mutex<Inner>,
}

impl InMemoryAnomalySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded anomalies, in recording order.
    #[must_use]
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.lock().anomalies.clone()
    }

    /// Number of recorded anomalies of the given kind.
    #[must_use]
    pub fn count(&self, kind: AnomalyKind) -> usize {
        self.lock()
            .anomalies
            .iter()
            .filter(|a| a.kind == kind)
            .count()
    }

    /// Total number of recorded anomaly entries.
    #[must_use]
    pub fn total(&self) -> usize {
        self.lock().anomalies.len()
    }

    /// Whether a done record is quarantined under the given key.
    #[must_use]
    pub fn is_quarantined(&self, key: &Key) -> bool {
        self.lock().quarantined.contains_key(key)
    }

    /// Keys with a quarantined done record.
    #[must_use]
    pub fn quarantined_keys(&self) -> Vec<Key> {
        self.lock().quarantined.keys().cloned().collect()
    }

    /// Quarantined records that carried no extractable key.
    #[must_use]
    pub fn keyless_quarantine(&self) -> Vec<RawRecord> {
        self.lock().keyless_quarantine.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[allow(clippy::unwrap_used)] // Mutex poisoning only follows a panicked test
        self.inner.lock().unwrap()
    }
}

impl AnomalySink for InMemoryAnomalySink {
    fn record(
        &self,
        anomaly: Anomaly,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.lock();

            // Same natural occurrence: bump the attempt counter in place.
            // Offsets only identify a record within one partition, so the
            // partition is part of the identity.
            if anomaly.offset.is_some() {
                if let Some(existing) = inner.anomalies.iter_mut().find(|a| {
                    a.kind == anomaly.kind
                        && a.stream == anomaly.stream
                        && a.partition == anomaly.partition
                        && a.offset == anomaly.offset
                }) {
                    existing.attempt_count += 1;
                    return Ok(());
                }
            }

            inner.anomalies.push(anomaly);
            Ok(())
        })
    }

    fn query(
        &self,
        kind: Option<AnomalyKind>,
        older_than: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Anomaly>, SinkError>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut matches: Vec<Anomaly> = inner
                .anomalies
                .iter()
                .filter(|a| kind.is_none_or(|k| a.kind == k))
                .filter(|a| older_than.is_none_or(|t| a.observed_at < t))
                .cloned()
                .collect();
            matches.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
            Ok(matches)
        })
    }

    fn quarantine(
        &self,
        key: Option<Key>,
        record: RawRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.lock();
            match key {
                Some(key) => {
                    inner.quarantined.insert(key, record);
                }
                None => inner.keyless_quarantine.push(record),
            }
            Ok(())
        })
    }

    fn take_quarantined(
        &self,
        key: &Key,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RawRecord>, SinkError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move { Ok(self.lock().quarantined.remove(&key)) })
    }
}
