mod clock;
mod engine;
mod types;

#[cfg(test)]
mod tests;

pub use clock::{Clock, SystemClock};
pub use types::{ArbitrationPolicy, Outcome, ReadingKey, ReadingRecord};

#[cfg(test)]
pub use clock::ManualClock;

use crate::ack::AckCommand;
use crate::stats::IngestStats;
use crate::store::ReadingStore;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Observed reopening window of the deployed gateways.
pub const DEFAULT_REOPEN_WINDOW_SECS: u64 = 3;

/// Decides first-write / overwrite / reject for each report.
///
/// Holds no mutable state of its own: every decision is a single conditional write against
/// the shared store, so any number of clones (or processes) may ingest concurrently.
#[derive(Clone)]
pub struct Arbiter {
    store: Arc<dyn ReadingStore>,
    clock: Arc<dyn Clock>,
    policy: ArbitrationPolicy,
    reopen_window: ChronoDuration,
    ack_tx: Option<mpsc::UnboundedSender<AckCommand>>,
    stats: Arc<IngestStats>,
}
