mod memory;
mod postgres;

pub use memory::MemoryReadingStore;
pub use postgres::PgReadingStore;

use crate::arbitration::{ReadingKey, ReadingRecord};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result of a conditional write. `ConditionFailed` is a normal arbitration signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResult {
    Applied,
    ConditionFailed,
}

impl WriteResult {
    fn from_rows_affected(rows: u64) -> Self {
        if rows > 0 {
            WriteResult::Applied
        } else {
            WriteResult::ConditionFailed
        }
    }
}

/// Reading storage keyed by `(device_id, sequence_number)`.
///
/// The conditional operations must be linearizable per key: among concurrent callers for the
/// same key, at most one `create_if_absent` applies, and once a record exists at most one
/// conditional update applies for any given condition.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Inserts `record` only if no record exists for its key.
    async fn create_if_absent(&self, record: &ReadingRecord) -> Result<WriteResult, StorageError>;

    /// Replaces the mutable attributes only if the stored `db_update_time <= threshold`.
    async fn update_if_older_than(
        &self,
        record: &ReadingRecord,
        threshold: DateTime<Utc>,
    ) -> Result<WriteResult, StorageError>;

    /// Replaces the mutable attributes only if the stored rssi is strictly weaker than the
    /// incoming one. A missing rssi on either side never wins.
    async fn update_if_weaker_than(
        &self,
        record: &ReadingRecord,
    ) -> Result<WriteResult, StorageError>;

    async fn get(&self, key: &ReadingKey) -> Result<Option<ReadingRecord>, StorageError>;

    /// Records of one device whose report timestamp lies in `[start, end]`, oldest first.
    async fn query_by_timestamp(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ReadingRecord>, StorageError>;

    /// Sorted distinct device ids.
    async fn list_devices(&self) -> Result<Vec<String>, StorageError>;

    /// Deletes a device's records with `sequence_number` in `[start, end]`.
    async fn delete_sequence_range(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<u64, StorageError>;
}
