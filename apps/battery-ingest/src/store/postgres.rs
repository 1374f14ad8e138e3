use super::{ReadingStore, WriteResult};
use crate::arbitration::{ReadingKey, ReadingRecord};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

/// Postgres-backed store. Per-key linearizability comes from the primary key plus
/// `ON CONFLICT DO NOTHING` for creates and a guarded `UPDATE ... WHERE` for overwrites;
/// concurrent updaters re-check the guard after acquiring the row lock.
#[derive(Clone)]
pub struct PgReadingStore {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = r#"
    device_id,
    sequence_number,
    gateway_id,
    report_timestamp,
    rssi,
    voltages,
    temperature,
    humidity,
    db_update_time
"#;

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                device_id text NOT NULL,
                sequence_number bigint NOT NULL,
                gateway_id text NOT NULL,
                report_timestamp bigint NOT NULL,
                rssi integer NULL,
                voltages numeric[] NULL,
                temperature numeric NULL,
                humidity numeric NULL,
                db_update_time timestamptz NOT NULL,
                PRIMARY KEY (device_id, sequence_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS readings_device_timestamp_idx
            ON readings (device_id, report_timestamp)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn map_row(row: &PgRow) -> Result<ReadingRecord, StorageError> {
    Ok(ReadingRecord {
        device_id: row.try_get("device_id")?,
        sequence_number: row.try_get("sequence_number")?,
        gateway_id: row.try_get("gateway_id")?,
        timestamp: row.try_get("report_timestamp")?,
        rssi: row.try_get("rssi")?,
        voltages: row.try_get("voltages")?,
        temperature: row.try_get("temperature")?,
        humidity: row.try_get("humidity")?,
        db_update_time: row.try_get("db_update_time")?,
    })
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn create_if_absent(&self, record: &ReadingRecord) -> Result<WriteResult, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO readings (
                device_id, sequence_number, gateway_id, report_timestamp,
                rssi, voltages, temperature, humidity, db_update_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (device_id, sequence_number) DO NOTHING
            "#,
        )
        .bind(&record.device_id)
        .bind(record.sequence_number)
        .bind(&record.gateway_id)
        .bind(record.timestamp)
        .bind(record.rssi)
        .bind(&record.voltages)
        .bind(record.temperature)
        .bind(record.humidity)
        .bind(record.db_update_time)
        .execute(&self.pool)
        .await?;
        Ok(WriteResult::from_rows_affected(result.rows_affected()))
    }

    async fn update_if_older_than(
        &self,
        record: &ReadingRecord,
        threshold: DateTime<Utc>,
    ) -> Result<WriteResult, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE readings
            SET gateway_id = $3,
                report_timestamp = $4,
                rssi = $5,
                voltages = $6,
                temperature = $7,
                humidity = $8,
                db_update_time = $9
            WHERE device_id = $1
              AND sequence_number = $2
              AND db_update_time <= $10
            "#,
        )
        .bind(&record.device_id)
        .bind(record.sequence_number)
        .bind(&record.gateway_id)
        .bind(record.timestamp)
        .bind(record.rssi)
        .bind(&record.voltages)
        .bind(record.temperature)
        .bind(record.humidity)
        .bind(record.db_update_time)
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(WriteResult::from_rows_affected(result.rows_affected()))
    }

    async fn update_if_weaker_than(
        &self,
        record: &ReadingRecord,
    ) -> Result<WriteResult, StorageError> {
        // NULL rssi on either side makes the comparison false.
        let result = sqlx::query(
            r#"
            UPDATE readings
            SET gateway_id = $3,
                report_timestamp = $4,
                rssi = $5,
                voltages = $6,
                temperature = $7,
                humidity = $8,
                db_update_time = $9
            WHERE device_id = $1
              AND sequence_number = $2
              AND rssi < $5
              AND db_update_time <= $9
            "#,
        )
        .bind(&record.device_id)
        .bind(record.sequence_number)
        .bind(&record.gateway_id)
        .bind(record.timestamp)
        .bind(record.rssi)
        .bind(&record.voltages)
        .bind(record.temperature)
        .bind(record.humidity)
        .bind(record.db_update_time)
        .execute(&self.pool)
        .await?;
        Ok(WriteResult::from_rows_affected(result.rows_affected()))
    }

    async fn get(&self, key: &ReadingKey) -> Result<Option<ReadingRecord>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM readings WHERE device_id = $1 AND sequence_number = $2"
        ))
        .bind(&key.device_id)
        .bind(key.sequence_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn query_by_timestamp(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ReadingRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM readings
            WHERE device_id = $1
              AND report_timestamp BETWEEN $2 AND $3
            ORDER BY report_timestamp ASC, sequence_number ASC
            "#
        ))
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    async fn list_devices(&self) -> Result<Vec<String>, StorageError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT device_id FROM readings ORDER BY device_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn delete_sequence_range(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM readings
            WHERE device_id = $1
              AND sequence_number BETWEEN $2 AND $3
            "#,
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
