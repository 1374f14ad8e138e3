use super::{Arbiter, ArbitrationPolicy, Clock, Outcome, ReadingRecord, SystemClock};
use crate::ack::AckCommand;
use crate::error::{IngestError, StorageError};
use crate::report::{Destination, Report, WireReport};
use crate::stats::IngestStats;
use crate::store::{ReadingStore, WriteResult};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tokio::sync::mpsc;

impl Arbiter {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        policy: ArbitrationPolicy,
        reopen_window: std::time::Duration,
        ack_tx: Option<mpsc::UnboundedSender<AckCommand>>,
        stats: Arc<IngestStats>,
    ) -> Self {
        let reopen_window =
            ChronoDuration::from_std(reopen_window).unwrap_or(ChronoDuration::MAX);
        Self {
            store,
            clock: Arc::new(SystemClock),
            policy,
            reopen_window,
            ack_tx,
            stats,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn store(&self) -> Arc<dyn ReadingStore> {
        self.store.clone()
    }

    /// Single-report entry point shared by the MQTT and HTTP surfaces.
    pub async fn ingest(&self, wire: &WireReport) -> Result<Outcome, IngestError> {
        let result = self.screen_and_arbitrate(wire).await;
        match &result {
            Ok(outcome) => self.stats.record_outcome(*outcome),
            Err(IngestError::Validation(err)) => {
                self.stats.record_validation_error();
                tracing::debug!(error = %err, "rejected malformed report");
            }
            Err(IngestError::Storage(err)) => {
                self.stats.record_storage_error(err.to_string());
                tracing::error!(error = %err, "storage failure during arbitration");
            }
        }
        result
    }

    async fn screen_and_arbitrate(&self, wire: &WireReport) -> Result<Outcome, IngestError> {
        if let Destination::Other(destination) = wire.check_required()?.destination {
            tracing::debug!(destination = %destination, "ignoring report for foreign destination");
            return Ok(Outcome::IgnoredDestination);
        }
        let report = wire.normalize()?;
        Ok(self.arbitrate(&report).await?)
    }

    /// Runs the per-key state machine for an already normalized report.
    ///
    /// The ack is queued only after the store confirmed the write; a caller that drops this
    /// future before then leaves no ack behind.
    pub async fn arbitrate(&self, report: &Report) -> Result<Outcome, StorageError> {
        let now = self.clock.now();
        let record = ReadingRecord::from_report(report, now);

        if self.store.create_if_absent(&record).await? == WriteResult::Applied {
            self.stats.clear_error();
            self.acknowledge(&record, Outcome::FirstStored);
            return Ok(Outcome::FirstStored);
        }

        let (result, on_success) = match self.policy {
            ArbitrationPolicy::Timeout => match now.checked_sub_signed(self.reopen_window) {
                Some(threshold) => (
                    self.store.update_if_older_than(&record, threshold).await?,
                    Outcome::TimeoutUpdated,
                ),
                // A window reaching before the representable range has never elapsed.
                None => (WriteResult::ConditionFailed, Outcome::TimeoutUpdated),
            },
            ArbitrationPolicy::Rssi => (
                self.store.update_if_weaker_than(&record).await?,
                Outcome::RssiUpdated,
            ),
        };
        self.stats.clear_error();

        match result {
            WriteResult::Applied => {
                self.acknowledge(&record, on_success);
                Ok(on_success)
            }
            WriteResult::ConditionFailed => {
                tracing::debug!(
                    key = %record.key(),
                    gateway = %record.gateway_id,
                    policy = self.policy.as_str(),
                    "duplicate report lost arbitration"
                );
                Ok(Outcome::NoUpdateNeeded)
            }
        }
    }

    fn acknowledge(&self, record: &ReadingRecord, outcome: Outcome) {
        tracing::info!(
            key = %record.key(),
            gateway = %record.gateway_id,
            rssi = ?record.rssi,
            outcome = %outcome,
            "reading accepted"
        );
        let Some(tx) = self.ack_tx.as_ref() else {
            return;
        };
        let cmd = AckCommand {
            gateway_id: record.gateway_id.clone(),
            device_id: record.device_id.clone(),
            sequence_number: record.sequence_number,
            acked_at: record.db_update_time,
        };
        if tx.send(cmd).is_err() {
            tracing::warn!(key = %record.key(), "ack channel closed; dropping ack");
        }
    }
}
