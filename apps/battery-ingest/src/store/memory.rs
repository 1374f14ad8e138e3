use super::{ReadingStore, WriteResult};
use crate::arbitration::{ReadingKey, ReadingRecord};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Single-process store. Every conditional operation runs under one lock, which makes it
/// linearizable for callers sharing this instance; it gives no guarantee across processes.
#[derive(Debug, Default)]
pub struct MemoryReadingStore {
    records: Mutex<BTreeMap<ReadingKey, ReadingRecord>>,
}

impl MemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, BTreeMap<ReadingKey, ReadingRecord>>, StorageError> {
        self.records
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn conditional_update<F>(
        &self,
        record: &ReadingRecord,
        condition: F,
    ) -> Result<WriteResult, StorageError>
    where
        F: FnOnce(&ReadingRecord) -> bool,
    {
        let mut records = self.records()?;
        match records.get_mut(&record.key()) {
            Some(existing) if condition(existing) => {
                existing.overwrite_with(record);
                Ok(WriteResult::Applied)
            }
            _ => Ok(WriteResult::ConditionFailed),
        }
    }
}

#[async_trait]
impl ReadingStore for MemoryReadingStore {
    async fn create_if_absent(&self, record: &ReadingRecord) -> Result<WriteResult, StorageError> {
        let mut records = self.records()?;
        let key = record.key();
        if records.contains_key(&key) {
            return Ok(WriteResult::ConditionFailed);
        }
        records.insert(key, record.clone());
        Ok(WriteResult::Applied)
    }

    async fn update_if_older_than(
        &self,
        record: &ReadingRecord,
        threshold: DateTime<Utc>,
    ) -> Result<WriteResult, StorageError> {
        self.conditional_update(record, |existing| existing.db_update_time <= threshold)
    }

    async fn update_if_weaker_than(
        &self,
        record: &ReadingRecord,
    ) -> Result<WriteResult, StorageError> {
        self.conditional_update(record, |existing| {
            let stronger = matches!(
                (existing.rssi, record.rssi),
                (Some(stored), Some(incoming)) if stored < incoming
            );
            stronger && existing.db_update_time <= record.db_update_time
        })
    }

    async fn get(&self, key: &ReadingKey) -> Result<Option<ReadingRecord>, StorageError> {
        Ok(self.records()?.get(key).cloned())
    }

    async fn query_by_timestamp(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ReadingRecord>, StorageError> {
        let records = self.records()?;
        let mut out: Vec<ReadingRecord> = records
            .values()
            .filter(|r| r.device_id == device_id && r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.timestamp, r.sequence_number));
        Ok(out)
    }

    async fn list_devices(&self) -> Result<Vec<String>, StorageError> {
        let records = self.records()?;
        let ids: BTreeSet<&str> = records.keys().map(|k| k.device_id.as_str()).collect();
        Ok(ids.into_iter().map(str::to_string).collect())
    }

    async fn delete_sequence_range(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<u64, StorageError> {
        if end < start {
            return Ok(0);
        }
        let mut records = self.records()?;
        let doomed: Vec<ReadingKey> = records
            .range(ReadingKey::new(device_id, start)..=ReadingKey::new(device_id, end))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            records.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}
