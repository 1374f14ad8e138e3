use super::{Arbiter, ArbitrationPolicy, ManualClock, Outcome, ReadingKey, ReadingRecord};
use crate::ack::AckCommand;
use crate::error::{IngestError, StorageError, ValidationError};
use crate::report::{WireNumber, WireReport};
use crate::stats::IngestStats;
use crate::store::{MemoryReadingStore, PgReadingStore, ReadingStore, WriteResult};
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

const WINDOW: std::time::Duration = std::time::Duration::from_secs(3);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 26, 10, 40, 0).unwrap()
}

fn report(destination: &str, device: &str, seq: i64, rssi: i64, ts: i64) -> WireReport {
    WireReport {
        destination: Some(destination.to_string()),
        gateway_id: Some(format!("gw{}", -rssi)),
        device_id: Some(device.to_string()),
        sequence_number: Some(seq.into()),
        timestamp: Some(ts.into()),
        rssi: Some(rssi.into()),
        voltages: Some(vec![WireNumber::from("3.30"), WireNumber::from("3.28")]),
        temperature: Some(WireNumber::from("24.8")),
        humidity: None,
    }
}

struct Harness {
    arbiter: Arbiter,
    store: Arc<dyn ReadingStore>,
    clock: Arc<ManualClock>,
    acks: mpsc::UnboundedReceiver<AckCommand>,
    stats: Arc<IngestStats>,
}

impl Harness {
    fn with_store(store: Arc<dyn ReadingStore>, policy: ArbitrationPolicy) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let stats = Arc::new(IngestStats::new());
        let (ack_tx, acks) = crate::ack::channel();
        let arbiter = Arbiter::new(store.clone(), policy, WINDOW, Some(ack_tx), stats.clone())
            .with_clock(clock.clone());
        Self {
            arbiter,
            store,
            clock,
            acks,
            stats,
        }
    }

    fn memory(policy: ArbitrationPolicy) -> Self {
        Self::with_store(Arc::new(MemoryReadingStore::new()), policy)
    }

    fn drain_acks(&mut self) -> Vec<AckCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.acks.try_recv() {
            out.push(cmd);
        }
        out
    }

    async fn stored(&self, device: &str, seq: i64) -> Option<ReadingRecord> {
        self.store.get(&ReadingKey::new(device, seq)).await.unwrap()
    }
}

#[tokio::test]
async fn duplicate_within_window_loses_then_late_report_overwrites() {
    let mut h = Harness::memory(ArbitrationPolicy::Timeout);

    let outcome = h.arbiter.ingest(&report("server", "dev-1", 42, -60, 100)).await.unwrap();
    assert_eq!(outcome, Outcome::FirstStored);
    assert_eq!(h.stored("dev-1", 42).await.unwrap().rssi, Some(-60));

    h.clock.advance(Duration::milliseconds(500));
    let outcome = h.arbiter.ingest(&report("server", "dev-1", 42, -70, 101)).await.unwrap();
    assert_eq!(outcome, Outcome::NoUpdateNeeded);
    let stored = h.stored("dev-1", 42).await.unwrap();
    assert_eq!(stored.rssi, Some(-60));
    assert_eq!(stored.timestamp, 100);
    assert_eq!(stored.db_update_time, t0());

    h.clock.advance(Duration::seconds(3));
    let outcome = h.arbiter.ingest(&report("server", "dev-1", 42, -80, 200)).await.unwrap();
    assert_eq!(outcome, Outcome::TimeoutUpdated);
    let stored = h.stored("dev-1", 42).await.unwrap();
    assert_eq!(stored.rssi, Some(-80));
    assert_eq!(stored.timestamp, 200);
    assert_eq!(stored.gateway_id, "gw80");
    assert_eq!(stored.db_update_time, t0() + Duration::milliseconds(3500));

    let acks = h.drain_acks();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].gateway_id, "gw60");
    assert_eq!(acks[1].gateway_id, "gw80");
    assert_eq!(acks[1].sequence_number, 42);
}

#[tokio::test]
async fn window_boundary_is_inclusive() {
    let mut h = Harness::memory(ArbitrationPolicy::Timeout);
    h.arbiter.ingest(&report("server", "dev-1", 7, -60, 100)).await.unwrap();

    h.clock.advance(Duration::seconds(3) - Duration::milliseconds(1));
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 7, -61, 100)).await.unwrap(),
        Outcome::NoUpdateNeeded
    );

    h.clock.advance(Duration::milliseconds(1));
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 7, -62, 100)).await.unwrap(),
        Outcome::TimeoutUpdated
    );
    let stored = h.stored("dev-1", 7).await.unwrap();
    assert_eq!(stored.db_update_time, t0() + Duration::seconds(3));

    // The window restarts from the overwrite.
    h.clock.advance(Duration::seconds(1));
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 7, -63, 100)).await.unwrap(),
        Outcome::NoUpdateNeeded
    );
    assert_eq!(h.drain_acks().len(), 2);
}

#[tokio::test]
async fn db_update_time_uses_ingestion_clock_not_report_timestamp() {
    let h = Harness::memory(ArbitrationPolicy::Timeout);
    h.arbiter.ingest(&report("server", "dev-1", 1, -60, 5)).await.unwrap();
    let stored = h.stored("dev-1", 1).await.unwrap();
    assert_eq!(stored.timestamp, 5);
    assert_eq!(stored.db_update_time, t0());
}

#[tokio::test]
async fn normalizes_decimals_before_storing() {
    let h = Harness::memory(ArbitrationPolicy::Timeout);
    h.arbiter.ingest(&report("server", "dev-1", 1, -60, 5)).await.unwrap();
    let stored = h.stored("dev-1", 1).await.unwrap();
    assert_eq!(
        stored.voltages,
        Some(vec![
            Decimal::from_str("3.30").unwrap(),
            Decimal::from_str("3.28").unwrap()
        ])
    );
    assert_eq!(stored.temperature, Some(Decimal::from_str("24.8").unwrap()));
    assert_eq!(stored.humidity, None);
}

#[tokio::test]
async fn ping_is_keyed_on_sequence_zero() {
    let mut h = Harness::memory(ArbitrationPolicy::Timeout);
    let outcome = h.arbiter.ingest(&report("ping", "dev-9", 5150, -55, 10)).await.unwrap();
    assert_eq!(outcome, Outcome::FirstStored);
    assert!(h.stored("dev-9", 5150).await.is_none());
    let stored = h.stored("dev-9", 0).await.unwrap();
    assert!(stored.voltages.is_none());
    assert!(stored.temperature.is_none());

    h.clock.advance(Duration::seconds(1));
    let outcome = h.arbiter.ingest(&report("ping", "dev-9", 5151, -50, 11)).await.unwrap();
    assert_eq!(outcome, Outcome::NoUpdateNeeded);

    h.clock.advance(Duration::seconds(5));
    let outcome = h.arbiter.ingest(&report("ping", "dev-9", 5152, -50, 17)).await.unwrap();
    assert_eq!(outcome, Outcome::TimeoutUpdated);

    let acks = h.drain_acks();
    assert_eq!(acks.len(), 2);
    assert!(acks.iter().all(|ack| ack.sequence_number == 0));
}

#[tokio::test]
async fn foreign_destination_is_ignored_without_side_effects() {
    let mut h = Harness::memory(ArbitrationPolicy::Timeout);
    let outcome = h.arbiter.ingest(&report("gateway", "dev-1", 1, -60, 5)).await.unwrap();
    assert_eq!(outcome, Outcome::IgnoredDestination);
    assert!(h.store.list_devices().await.unwrap().is_empty());
    assert!(h.drain_acks().is_empty());
    assert_eq!(h.stats.ignored_destination.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn missing_required_field_fails_without_write() {
    let mut h = Harness::memory(ArbitrationPolicy::Timeout);
    let mut wire = report("server", "dev-1", 1, -60, 5);
    wire.timestamp = None;
    let err = h.arbiter.ingest(&wire).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::Validation(ValidationError::MissingField("timestamp"))
    ));

    let mut wire = report("gateway", "dev-1", 1, -60, 5);
    wire.destination = None;
    assert!(matches!(
        h.arbiter.ingest(&wire).await.unwrap_err(),
        IngestError::Validation(ValidationError::MissingField("destination"))
    ));

    assert!(h.store.list_devices().await.unwrap().is_empty());
    assert!(h.drain_acks().is_empty());
    assert_eq!(h.stats.validation_errors.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn malformed_voltage_fails_without_write() {
    let mut h = Harness::memory(ArbitrationPolicy::Timeout);
    let mut wire = report("server", "dev-1", 1, -60, 5);
    wire.voltages = Some(vec![WireNumber::from("3.3"), WireNumber::from("n/a")]);
    let err = h.arbiter.ingest(&wire).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::Validation(ValidationError::InvalidField { field: "voltages", .. })
    ));
    assert!(h.stored("dev-1", 1).await.is_none());
    assert!(h.drain_acks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_store_exactly_once() {
    let mut h = Harness::memory(ArbitrationPolicy::Timeout);
    let mut handles = Vec::new();
    for rssi in 40..56 {
        let arbiter = h.arbiter.clone();
        handles.push(tokio::spawn(async move {
            arbiter.ingest(&report("server", "dev-1", 99, -rssi, 100)).await
        }));
    }

    let mut first = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Outcome::FirstStored => first += 1,
            Outcome::NoUpdateNeeded => rejected += 1,
            other => panic!("unexpected outcome {other}"),
        }
    }
    assert_eq!(first, 1);
    assert_eq!(rejected, 15);
    assert_eq!(h.drain_acks().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_late_reports_overwrite_once_per_window() {
    let mut h = Harness::memory(ArbitrationPolicy::Timeout);
    h.arbiter.ingest(&report("server", "dev-1", 5, -60, 100)).await.unwrap();
    h.drain_acks();
    h.clock.advance(Duration::seconds(10));

    let mut handles = Vec::new();
    for rssi in 61..69 {
        let arbiter = h.arbiter.clone();
        handles.push(tokio::spawn(async move {
            arbiter.ingest(&report("server", "dev-1", 5, -rssi, 100)).await
        }));
    }
    let mut updated = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() == Outcome::TimeoutUpdated {
            updated += 1;
        }
    }
    assert_eq!(updated, 1);
    assert_eq!(h.drain_acks().len(), 1);
}

#[tokio::test]
async fn rssi_policy_keeps_the_strongest_signal() {
    let mut h = Harness::memory(ArbitrationPolicy::Rssi);
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 3, -70, 100)).await.unwrap(),
        Outcome::FirstStored
    );
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 3, -80, 100)).await.unwrap(),
        Outcome::NoUpdateNeeded
    );
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 3, -70, 100)).await.unwrap(),
        Outcome::NoUpdateNeeded
    );
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 3, -50, 100)).await.unwrap(),
        Outcome::RssiUpdated
    );
    // Window elapsed but the signal is weaker: the rssi policy ignores time.
    h.clock.advance(Duration::seconds(60));
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 3, -90, 100)).await.unwrap(),
        Outcome::NoUpdateNeeded
    );

    let stored = h.stored("dev-1", 3).await.unwrap();
    assert_eq!(stored.rssi, Some(-50));
    assert_eq!(stored.gateway_id, "gw50");
    let acks = h.drain_acks();
    assert_eq!(acks.len(), 2);
    assert_eq!(h.stats.rssi_updated.load(Ordering::Relaxed), 1);
}

struct FailingStore;

#[async_trait]
impl ReadingStore for FailingStore {
    async fn create_if_absent(&self, _record: &ReadingRecord) -> Result<WriteResult, StorageError> {
        Err(StorageError::Unavailable("connection refused".to_string()))
    }

    async fn update_if_older_than(
        &self,
        _record: &ReadingRecord,
        _threshold: DateTime<Utc>,
    ) -> Result<WriteResult, StorageError> {
        Err(StorageError::Unavailable("connection refused".to_string()))
    }

    async fn update_if_weaker_than(
        &self,
        _record: &ReadingRecord,
    ) -> Result<WriteResult, StorageError> {
        Err(StorageError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _key: &ReadingKey) -> Result<Option<ReadingRecord>, StorageError> {
        Ok(None)
    }

    async fn query_by_timestamp(
        &self,
        _device_id: &str,
        _start: i64,
        _end: i64,
    ) -> Result<Vec<ReadingRecord>, StorageError> {
        Ok(Vec::new())
    }

    async fn list_devices(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }

    async fn delete_sequence_range(
        &self,
        _device_id: &str,
        _start: i64,
        _end: i64,
    ) -> Result<u64, StorageError> {
        Ok(0)
    }
}

#[tokio::test]
async fn storage_failure_propagates_without_ack() {
    let mut h = Harness::with_store(Arc::new(FailingStore), ArbitrationPolicy::Timeout);
    let err = h
        .arbiter
        .ingest(&report("server", "dev-1", 1, -60, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Storage(_)));
    assert!(h.drain_acks().is_empty());
    assert_eq!(h.stats.storage_errors.load(Ordering::Relaxed), 1);
    assert!(h.stats.snapshot().last_error.is_some());
}

#[tokio::test]
async fn closed_ack_channel_does_not_fail_ingestion() {
    let h = Harness::memory(ArbitrationPolicy::Timeout);
    let Harness { arbiter, acks, .. } = h;
    drop(acks);
    assert_eq!(
        arbiter.ingest(&report("server", "dev-1", 1, -60, 5)).await.unwrap(),
        Outcome::FirstStored
    );
}

#[tokio::test]
async fn unbounded_window_never_reopens() {
    let store: Arc<dyn ReadingStore> = Arc::new(MemoryReadingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let (ack_tx, mut acks) = crate::ack::channel();
    let arbiter = Arbiter::new(
        store,
        ArbitrationPolicy::Timeout,
        std::time::Duration::from_secs(10_000_000_000_000),
        Some(ack_tx),
        Arc::new(IngestStats::new()),
    )
    .with_clock(clock.clone());

    let first = report("server", "dev-1", 1, -60, 5);
    assert_eq!(arbiter.ingest(&first).await.unwrap(), Outcome::FirstStored);
    clock.advance(Duration::days(365));
    assert_eq!(
        arbiter.ingest(&report("server", "dev-1", 1, -40, 5)).await.unwrap(),
        Outcome::NoUpdateNeeded
    );
    assert!(acks.try_recv().is_ok());
    assert!(acks.try_recv().is_err());
}

/// Never resolves any write, like a store behind a hung connection.
struct StalledStore;

#[async_trait]
impl ReadingStore for StalledStore {
    async fn create_if_absent(&self, _record: &ReadingRecord) -> Result<WriteResult, StorageError> {
        std::future::pending().await
    }

    async fn update_if_older_than(
        &self,
        _record: &ReadingRecord,
        _threshold: DateTime<Utc>,
    ) -> Result<WriteResult, StorageError> {
        std::future::pending().await
    }

    async fn update_if_weaker_than(
        &self,
        _record: &ReadingRecord,
    ) -> Result<WriteResult, StorageError> {
        std::future::pending().await
    }

    async fn get(&self, _key: &ReadingKey) -> Result<Option<ReadingRecord>, StorageError> {
        Ok(None)
    }

    async fn query_by_timestamp(
        &self,
        _device_id: &str,
        _start: i64,
        _end: i64,
    ) -> Result<Vec<ReadingRecord>, StorageError> {
        Ok(Vec::new())
    }

    async fn list_devices(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }

    async fn delete_sequence_range(
        &self,
        _device_id: &str,
        _start: i64,
        _end: i64,
    ) -> Result<u64, StorageError> {
        Ok(0)
    }
}

#[tokio::test]
async fn cancelled_ingest_emits_no_ack() {
    let mut h = Harness::with_store(Arc::new(StalledStore), ArbitrationPolicy::Timeout);
    let result = tokio::time::timeout(
        std::time::Duration::from_millis(50),
        h.arbiter.ingest(&report("server", "dev-1", 1, -60, 5)),
    )
    .await;
    assert!(result.is_err());
    assert!(h.drain_acks().is_empty());
    assert_eq!(h.stats.first_stored.load(Ordering::Relaxed), 0);
}

async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;
    Ok(pool)
}

async fn drop_test_schema(database_url: &str, schema: &str) {
    if let Ok(admin_pool) = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
    {
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;
    }
}

fn integration_database_url() -> Option<String> {
    if env::var("INGEST_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return None;
    }
    env::var("INGEST_TEST_DATABASE_URL").ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_arbitration_round() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("battery_ingest_test_{}", std::process::id());
    // The schema is dropped whether the round returns an error or panics on an assertion.
    let outcome = AssertUnwindSafe(postgres_arbitration_round(&database_url, &schema))
        .catch_unwind()
        .await;
    drop_test_schema(&database_url, &schema).await;
    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

async fn postgres_arbitration_round(database_url: &str, schema: &str) -> Result<()> {
    let pool = setup_test_pool(database_url, schema).await?;
    let store = PgReadingStore::new(pool);
    store.ensure_schema().await?;
    let mut h = Harness::with_store(Arc::new(store), ArbitrationPolicy::Timeout);

    let mut handles = Vec::new();
    for rssi in 60..68 {
        let arbiter = h.arbiter.clone();
        handles.push(tokio::spawn(async move {
            arbiter.ingest(&report("server", "dev-1", 42, -rssi, 100)).await
        }));
    }
    let mut first = 0;
    for handle in handles {
        if handle.await??.is_accepted() {
            first += 1;
        }
    }
    assert_eq!(first, 1);
    h.drain_acks();

    h.clock.advance(Duration::seconds(1));
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 42, -70, 101)).await?,
        Outcome::NoUpdateNeeded
    );
    h.clock.advance(Duration::seconds(2));
    assert_eq!(
        h.arbiter.ingest(&report("server", "dev-1", 42, -80, 200)).await?,
        Outcome::TimeoutUpdated
    );

    let stored = h.stored("dev-1", 42).await.expect("record exists");
    assert_eq!(stored.rssi, Some(-80));
    assert_eq!(stored.timestamp, 200);
    assert_eq!(stored.db_update_time, t0() + Duration::seconds(3));
    assert_eq!(
        stored.voltages,
        Some(vec![
            Decimal::from_str("3.30")?,
            Decimal::from_str("3.28")?
        ])
    );
    assert_eq!(h.drain_acks().len(), 1);

    h.arbiter.ingest(&report("server", "dev-2", 1, -60, 150)).await?;
    assert_eq!(h.store.list_devices().await?, vec!["dev-1", "dev-2"]);
    assert_eq!(h.store.query_by_timestamp("dev-1", 150, 250).await?.len(), 1);
    assert_eq!(h.store.delete_sequence_range("dev-1", 0, 100).await?, 1);
    assert!(h.store.query_by_timestamp("dev-1", 0, 1_000).await?.is_empty());
    Ok(())
}
