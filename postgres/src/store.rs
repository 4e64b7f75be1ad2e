//! PostgreSQL-backed match store.
//!
//! One row per key in `match_records`; all mutation goes through single
//! statements so atomicity comes from the database, not from caller-side
//! locking. The insert races through `ON CONFLICT DO NOTHING`, the
//! transition is a guarded `UPDATE ... WHERE state = 'pending'`.

use chrono::{DateTime, Utc};
use settlematch_core::key::Key;
use settlematch_core::store::{
    CreateOutcome, MatchRecord, MatchState, MatchStore, StoreError, TransitionOutcome,
};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-based [`MatchStore`].
///
/// # Example
///
/// ```no_run
/// use settlematch_postgres::PostgresMatchStore;
/// use settlematch_core::key::Key;
/// use settlematch_core::store::MatchStore;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresMatchStore::new(pool);
/// let outcome = store.try_create(Key::new("INV-2024-00017")).await?;
/// println!("create outcome: {outcome:?}");
/// # Ok(())
/// # }
/// ```
pub struct PostgresMatchStore {
    pool: PgPool,
}

impl PostgresMatchStore {
    /// Create a new match store with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn create_inner(&self, key: Key) -> Result<CreateOutcome, StoreError> {
        let inserted = sqlx::query(
            r"
            INSERT INTO match_records (key, state)
            VALUES ($1, 'pending')
            ON CONFLICT (key) DO NOTHING
            RETURNING key
            ",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_mutation_error(&e, &key))?;

        if inserted.is_some() {
            metrics::counter!("settlematch.store.created").increment(1);
            return Ok(CreateOutcome::Created);
        }

        // Insert lost the race; the existing row tells us which duplicate
        // flavor this is.
        let row = sqlx::query("SELECT state FROM match_records WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_read_error(&e))?;

        match row {
            Some(row) => {
                let state_str: String = row.get("state");
                Ok(CreateOutcome::AlreadyExists(MatchState::parse(&state_str)?))
            }
            // Conflict without a visible row: rows are never deleted, so this
            // means a concurrent transaction is mid-commit. Report the store
            // as unsettled rather than invent an outcome.
            None => Err(StoreError::Timeout { key }),
        }
    }

    async fn transition_inner(&self, key: Key) -> Result<TransitionOutcome, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE match_records
            SET state = 'done',
                updated_at = NOW(),
                version = version + 1
            WHERE key = $1 AND state = 'pending'
            ",
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_mutation_error(&e, &key))?;

        if result.rows_affected() > 0 {
            metrics::counter!("settlematch.store.transitioned").increment(1);
            return Ok(TransitionOutcome::Transitioned);
        }

        let row = sqlx::query("SELECT state FROM match_records WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_read_error(&e))?;

        match row {
            None => Ok(TransitionOutcome::NotFound),
            Some(row) => {
                let state_str: String = row.get("state");
                match MatchState::parse(&state_str)? {
                    // The guarded update saw no pending row but the read does:
                    // a create committed in between. Report NotFound so the
                    // caller's retry path picks it up cleanly.
                    MatchState::Pending => Ok(TransitionOutcome::NotFound),
                    state @ MatchState::Done => Ok(TransitionOutcome::WrongState(state)),
                }
            }
        }
    }

    async fn get_inner(&self, key: Key) -> Result<Option<MatchRecord>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT key, state, created_at, updated_at, version
            FROM match_records
            WHERE key = $1
            ",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_read_error(&e))?;

        row.map(|row| row_to_record(&row)).transpose()
    }

    async fn scan_inner(
        &self,
        state: Option<MatchState>,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<MatchRecord>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT key, state, created_at, updated_at, version
            FROM match_records
            WHERE ($1::TEXT IS NULL OR state = $1)
              AND ($2::TIMESTAMPTZ IS NULL OR updated_at < $2)
            ORDER BY updated_at ASC
            ",
        )
        .bind(state.map(MatchState::as_str))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_read_error(&e))?;

        rows.iter().map(row_to_record).collect()
    }
}

impl MatchStore for PostgresMatchStore {
    fn try_create(
        &self,
        key: Key,
    ) -> Pin<Box<dyn Future<Output = Result<CreateOutcome, StoreError>> + Send + '_>> {
        Box::pin(self.create_inner(key))
    }

    fn try_transition(
        &self,
        key: Key,
    ) -> Pin<Box<dyn Future<Output = Result<TransitionOutcome, StoreError>> + Send + '_>> {
        Box::pin(self.transition_inner(key))
    }

    fn get(
        &self,
        key: Key,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MatchRecord>, StoreError>> + Send + '_>> {
        Box::pin(self.get_inner(key))
    }

    fn scan(
        &self,
        state: Option<MatchState>,
        older_than: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MatchRecord>, StoreError>> + Send + '_>> {
        Box::pin(self.scan_inner(state, older_than))
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<MatchRecord, StoreError> {
    let key: String = row.get("key");
    let state_str: String = row.get("state");
    let version: i64 = row.get("version");

    Ok(MatchRecord {
        key: Key::new(key),
        state: MatchState::parse(&state_str)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        version: version.unsigned_abs(),
    })
}

/// Map a sqlx error on a read path.
///
/// Reads are side-effect free, so an ambiguous outcome is impossible: a
/// broken connection is simply the store being unavailable.
fn map_read_error(e: &sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Unavailable(e.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(e.to_string())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

/// Map a sqlx error on a mutation path.
///
/// A connection that broke mid-statement leaves the commit outcome unknown,
/// so I/O failures surface as [`StoreError::Timeout`] and force the caller
/// through the re-read protocol. Pool acquisition timeouts happen before any
/// statement is sent and stay unambiguous.
fn map_mutation_error(e: &sqlx::Error, key: &Key) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => StoreError::Unavailable(e.to_string()),
        sqlx::Error::Io(_) => StoreError::Timeout { key: key.clone() },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(e.to_string())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}
