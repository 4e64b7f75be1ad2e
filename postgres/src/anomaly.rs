//! PostgreSQL-backed anomaly sink and quarantine.
//!
//! Anomalies land in the append-only `anomalies` table; recording the same
//! natural occurrence again bumps `attempt_count` through an upsert on the
//! `(kind, stream, record_offset)` identity. Quarantined done records live
//! in `quarantined_records`, one per key, removed atomically on replay with
//! `DELETE ... RETURNING`.

use chrono::{DateTime, Utc};
use settlematch_core::anomaly::{Anomaly, AnomalyKind, AnomalySink, SinkError};
use settlematch_core::key::{Key, PartitionId};
use settlematch_core::record::{Offset, RawRecord, StreamKind};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-based [`AnomalySink`].
///
/// # Example
///
/// ```no_run
/// use settlematch_postgres::PostgresAnomalySink;
/// use settlematch_core::anomaly::{AnomalyKind, AnomalySink};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let sink = PostgresAnomalySink::new(pool);
/// let duplicates = sink.query(Some(AnomalyKind::DuplicateOutput), None).await?;
/// println!("duplicate confirmations: {}", duplicates.len());
/// # Ok(())
/// # }
/// ```
pub struct PostgresAnomalySink {
    pool: PgPool,
}

impl PostgresAnomalySink {
    /// Create a new anomaly sink with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn record_inner(&self, anomaly: Anomaly) -> Result<(), SinkError> {
        let key = anomaly.key.as_ref().map(Key::as_str);
        let stream = anomaly.stream.map(StreamKind::as_str);
        let partition = anomaly.partition.map(|p| i64::from(p.value()));
        let offset = anomaly.offset.map(offset_to_db);

        if stream.is_some() && partition.is_some() && offset.is_some() {
            // Occurrence has a natural identity; redelivery bumps the
            // attempt count instead of appending a second entry. Offsets
            // restart per partition, hence the partition in the target.
            sqlx::query(
                r"
                INSERT INTO anomalies (
                    key, kind, stream, partition_id, record_offset,
                    raw_payload, observed_at, attempt_count
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (kind, stream, partition_id, record_offset)
                    WHERE stream IS NOT NULL AND partition_id IS NOT NULL
                      AND record_offset IS NOT NULL
                    DO UPDATE SET attempt_count = anomalies.attempt_count + 1
                ",
            )
            .bind(key)
            .bind(anomaly.kind.as_str())
            .bind(stream)
            .bind(partition)
            .bind(offset)
            .bind(&anomaly.raw_payload)
            .bind(anomaly.observed_at)
            .bind(attempt_to_db(anomaly.attempt_count))
            .execute(&self.pool)
            .await
            .map_err(map_sink_error)?;
        } else {
            sqlx::query(
                r"
                INSERT INTO anomalies (
                    key, kind, stream, partition_id, record_offset,
                    raw_payload, observed_at, attempt_count
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(key)
            .bind(anomaly.kind.as_str())
            .bind(stream)
            .bind(partition)
            .bind(offset)
            .bind(&anomaly.raw_payload)
            .bind(anomaly.observed_at)
            .bind(attempt_to_db(anomaly.attempt_count))
            .execute(&self.pool)
            .await
            .map_err(map_sink_error)?;
        }

        tracing::warn!(
            kind = anomaly.kind.as_str(),
            key = ?anomaly.key,
            stream = ?stream,
            "Anomaly recorded"
        );

        metrics::counter!("settlematch.anomalies", "kind" => anomaly.kind.as_str())
            .increment(1);

        Ok(())
    }

    async fn query_inner(
        &self,
        kind: Option<AnomalyKind>,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Anomaly>, SinkError> {
        let rows = sqlx::query(
            r"
            SELECT key, kind, stream, partition_id, record_offset,
                   raw_payload, observed_at, attempt_count
            FROM anomalies
            WHERE ($1::TEXT IS NULL OR kind = $1)
              AND ($2::TIMESTAMPTZ IS NULL OR observed_at < $2)
            ORDER BY observed_at ASC
            ",
        )
        .bind(kind.map(AnomalyKind::as_str))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sink_error)?;

        rows.iter().map(row_to_anomaly).collect()
    }

    async fn quarantine_inner(&self, key: Option<Key>, record: RawRecord) -> Result<(), SinkError> {
        let partition = i64::from(record.partition.value());
        let offset = offset_to_db(record.offset);

        if let Some(key) = &key {
            // Re-parking the same key replaces the previous parked record.
            sqlx::query(
                r"
                INSERT INTO quarantined_records (key, partition_id, record_offset, payload)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (key) WHERE key IS NOT NULL
                    DO UPDATE SET partition_id = $2,
                                  record_offset = $3,
                                  payload = $4,
                                  quarantined_at = NOW()
                ",
            )
            .bind(key.as_str())
            .bind(partition)
            .bind(offset)
            .bind(&record.payload)
            .execute(&self.pool)
            .await
            .map_err(map_sink_error)?;
        } else {
            sqlx::query(
                r"
                INSERT INTO quarantined_records (key, partition_id, record_offset, payload)
                VALUES (NULL, $1, $2, $3)
                ",
            )
            .bind(partition)
            .bind(offset)
            .bind(&record.payload)
            .execute(&self.pool)
            .await
            .map_err(map_sink_error)?;
        }

        tracing::warn!(
            key = ?key,
            partition = %record.partition,
            offset = %record.offset,
            "Record quarantined"
        );

        metrics::counter!("settlematch.quarantined").increment(1);

        Ok(())
    }

    async fn take_quarantined_inner(&self, key: &Key) -> Result<Option<RawRecord>, SinkError> {
        let row = sqlx::query(
            r"
            DELETE FROM quarantined_records
            WHERE key = $1
            RETURNING partition_id, record_offset, payload
            ",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sink_error)?;

        row.map(|row| {
            let partition: i64 = row.get("partition_id");
            let offset: i64 = row.get("record_offset");
            let payload: Vec<u8> = row.get("payload");

            let partition = u32::try_from(partition)
                .map_err(|_| SinkError::Backend(format!("invalid partition id: {partition}")))?;

            Ok(RawRecord::new(
                PartitionId::new(partition),
                Offset::new(offset.unsigned_abs()),
                payload,
            ))
        })
        .transpose()
    }
}

impl AnomalySink for PostgresAnomalySink {
    fn record(
        &self,
        anomaly: Anomaly,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(self.record_inner(anomaly))
    }

    fn query(
        &self,
        kind: Option<AnomalyKind>,
        older_than: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Anomaly>, SinkError>> + Send + '_>> {
        Box::pin(self.query_inner(kind, older_than))
    }

    fn quarantine(
        &self,
        key: Option<Key>,
        record: RawRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(self.quarantine_inner(key, record))
    }

    fn take_quarantined(
        &self,
        key: &Key,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RawRecord>, SinkError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move { self.take_quarantined_inner(&key).await })
    }
}

fn row_to_anomaly(row: &sqlx::postgres::PgRow) -> Result<Anomaly, SinkError> {
    let key: Option<String> = row.get("key");
    let kind_str: String = row.get("kind");
    let stream_str: Option<String> = row.get("stream");
    let partition: Option<i64> = row.get("partition_id");
    let offset: Option<i64> = row.get("record_offset");
    let attempt_count: i32 = row.get("attempt_count");

    let stream = stream_str.as_deref().map(parse_stream).transpose()?;
    let partition = partition
        .map(|p| {
            u32::try_from(p)
                .map(PartitionId::new)
                .map_err(|_| SinkError::Backend(format!("invalid partition id: {p}")))
        })
        .transpose()?;

    Ok(Anomaly {
        key: key.map(Key::new),
        kind: AnomalyKind::parse(&kind_str)?,
        stream,
        partition,
        offset: offset.map(|o| Offset::new(o.unsigned_abs())),
        raw_payload: row.get("raw_payload"),
        observed_at: row.get("observed_at"),
        attempt_count: attempt_count.unsigned_abs(),
    })
}

fn parse_stream(s: &str) -> Result<StreamKind, SinkError> {
    match s {
        "pending" => Ok(StreamKind::Pending),
        "done" => Ok(StreamKind::Done),
        _ => Err(SinkError::Backend(format!("invalid stream kind: {s}"))),
    }
}

#[allow(clippy::cast_possible_wrap)] // Stream offsets stay far below i64::MAX
const fn offset_to_db(offset: Offset) -> i64 {
    offset.value() as i64
}

fn attempt_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn map_sink_error(e: sqlx::Error) -> SinkError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => SinkError::Unavailable(e.to_string()),
        _ => SinkError::Backend(e.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn stream_roundtrip() {
        for kind in &[StreamKind::Pending, StreamKind::Done] {
            let parsed = parse_stream(kind.as_str()).expect("valid stream should parse");
            assert_eq!(*kind, parsed);
        }
        assert!(parse_stream("sideways").is_err());
    }

    #[test]
    fn io_error_maps_to_unavailable() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken",
        ));
        assert!(matches!(map_sink_error(io), SinkError::Unavailable(_)));
    }

    #[test]
    fn attempt_count_saturates() {
        assert_eq!(attempt_to_db(3), 3);
        assert_eq!(attempt_to_db(u32::MAX), i32::MAX);
    }
}
