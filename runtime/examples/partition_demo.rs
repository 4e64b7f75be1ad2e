//! End-to-end demo of one partition worker over in-memory backends.
//!
//! Feeds a handful of instructions and confirmations — including a
//! confirmation that arrives before its instruction and a duplicated
//! delivery — then prints the resulting match states and anomaly log.
//!
//! Run with: `cargo run --example partition_demo`

use settlematch_core::anomaly::AnomalySink;
use settlematch_core::environment::SystemClock;
use settlematch_core::key::PartitionId;
use settlematch_core::store::MatchStore;
use settlematch_runtime::config::{IngestConfig, KeyStrategy};
use settlematch_runtime::ingester::Ingester;
use settlematch_testing::{InMemoryAnomalySink, InMemoryMatchStore, VecRecordStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn payload(reference: &str) -> Vec<u8> {
    format!(r#"{{"reference":"{reference}"}}"#).into_bytes()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let partition = PartitionId::new(0);
    let clock = Arc::new(SystemClock);
    let store = Arc::new(InMemoryMatchStore::new(clock.clone()));
    let sink = Arc::new(InMemoryAnomalySink::new());
    let pending = Arc::new(VecRecordStream::new(partition));
    let done = Arc::new(VecRecordStream::new(partition));

    let config = IngestConfig::builder()
        .partitions(1)
        .key_strategy(KeyStrategy::fields(vec!["reference".into()]))
        .idle_backoff(Duration::from_millis(10))
        .build()?;

    // Normal pair, a duplicated confirmation, and a confirmation whose
    // instruction shows up late.
    pending.push(payload("INV-1001"));
    pending.push(payload("INV-1002"));
    done.push(payload("INV-1001"));
    done.push(payload("INV-1001"));
    done.push(payload("INV-1003"));

    let mut ingester = Ingester::new(
        partition,
        &config,
        store.clone(),
        sink.clone(),
        pending.clone(),
        done.clone(),
        clock,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(async move { ingester.run(shutdown_rx).await });

    // Let the first wave settle, then deliver the late instruction.
    tokio::time::sleep(Duration::from_millis(200)).await;
    pending.push(payload("INV-1003"));
    tokio::time::sleep(Duration::from_millis(500)).await;

    shutdown_tx.send(true)?;
    worker.await?;

    for record in store.scan(None, None).await? {
        tracing::info!(key = %record.key, state = %record.state, version = record.version, "match record");
    }
    for anomaly in sink.query(None, None).await? {
        tracing::info!(
            kind = %anomaly.kind,
            key = ?anomaly.key,
            attempts = anomaly.attempt_count,
            "anomaly"
        );
    }

    Ok(())
}
