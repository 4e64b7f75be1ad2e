//! In-memory match store for fast, deterministic tests.

use crate::clock::ManualClock;
use settlematch_core::environment::Clock;
use settlematch_core::key::Key;
use settlematch_core::store::{
    CreateOutcome, MatchRecord, MatchState, MatchStore, StoreError, TransitionOutcome,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// A failure injected ahead of the next mutating store call.
///
/// Timeout faults come in two flavors so ambiguous-commit handling can be
/// tested from both sides: the mutation may or may not have applied before
/// the timeout was reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreFault {
    /// The next mutating call fails with `Unavailable`, nothing applied.
    Unavailable,
    /// The next mutating call times out without applying.
    TimeoutBeforeApply,
    /// The next mutating call applies, then reports a timeout anyway.
    TimeoutAfterApply,
}

#[derive(Default)]
struct Inner {
    records: HashMap<Key, MatchRecord>,
    faults: VecDeque<StoreFault>,
}

/// `HashMap`-backed [`MatchStore`] with scriptable fault injection.
///
/// All operations are atomic under one mutex, which trivially satisfies the
/// per-key atomicity and read-your-writes requirements of the contract.
pub struct InMemoryMatchStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryMatchStore {
    fn default() -> Self {
        Self::new(Arc::new(ManualClock::default()))
    }
}

impl InMemoryMatchStore {
    /// Create a store stamping records with the given clock.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    /// Queue a fault for the next mutating call (`try_create` or
    /// `try_transition`). Faults apply in FIFO order, one per call.
    pub fn inject_fault(&self, fault: StoreFault) {
        self.lock().faults.push_back(fault);
    }

    /// Number of records currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[allow(clippy::unwrap_used)] // Mutex poisoning only follows a panicked test
        self.inner.lock().unwrap()
    }

    fn create_sync(&self, key: Key) -> Result<CreateOutcome, StoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let applied_fault = inner.faults.pop_front();
        if let Some(StoreFault::Unavailable) = applied_fault {
            return Err(StoreError::Unavailable("injected".to_string()));
        }
        if let Some(StoreFault::TimeoutBeforeApply) = applied_fault {
            return Err(StoreError::Timeout { key });
        }

        let outcome = match inner.records.get(&key) {
            Some(existing) => CreateOutcome::AlreadyExists(existing.state),
            None => {
                inner.records.insert(
                    key.clone(),
                    MatchRecord {
                        key: key.clone(),
                        state: MatchState::Pending,
                        created_at: now,
                        updated_at: now,
                        version: 1,
                    },
                );
                CreateOutcome::Created
            }
        };

        if let Some(StoreFault::TimeoutAfterApply) = applied_fault {
            return Err(StoreError::Timeout { key });
        }
        Ok(outcome)
    }

    fn transition_sync(&self, key: Key) -> Result<TransitionOutcome, StoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let applied_fault = inner.faults.pop_front();
        if let Some(StoreFault::Unavailable) = applied_fault {
            return Err(StoreError::Unavailable("injected".to_string()));
        }
        if let Some(StoreFault::TimeoutBeforeApply) = applied_fault {
            return Err(StoreError::Timeout { key });
        }

        let outcome = match inner.records.get_mut(&key) {
            None => TransitionOutcome::NotFound,
            Some(record) if record.state == MatchState::Pending => {
                record.state = MatchState::Done;
                record.updated_at = now;
                record.version += 1;
                TransitionOutcome::Transitioned
            }
            Some(record) => TransitionOutcome::WrongState(record.state),
        };

        if let Some(StoreFault::TimeoutAfterApply) = applied_fault {
            return Err(StoreError::Timeout { key });
        }
        Ok(outcome)
    }
}

impl MatchStore for InMemoryMatchStore {
    fn try_create(
        &self,
        key: Key,
    ) -> Pin<Box<dyn Future<Output = Result<CreateOutcome, StoreError>> + Send + '_>> {
        Box::pin(async move { self.create_sync(key) })
    }

    fn try_transition(
        &self,
        key: Key,
    ) -> Pin<Box<dyn Future<Output = Result<TransitionOutcome, StoreError>> + Send + '_>> {
        Box::pin(async move { self.transition_sync(key) })
    }

    fn get(
        &self,
        key: Key,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MatchRecord>, StoreError>> + Send + '_>> {
        Box::pin(async move { Ok(self.lock().records.get(&key).cloned()) })
    }

    fn scan(
        &self,
        state: Option<MatchState>,
        older_than: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MatchRecord>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut matches: Vec<MatchRecord> = inner
                .records
                .values()
                .filter(|record| state.is_none_or(|s| record.state == s))
                .filter(|record| older_than.is_none_or(|t| record.updated_at < t))
                .cloned()
                .collect();
            matches.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
            Ok(matches)
        })
    }
}
