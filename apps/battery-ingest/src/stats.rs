use crate::arbitration::Outcome;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};

#[derive(Debug, Default)]
pub struct IngestStats {
    pub first_stored: AtomicU64,
    pub timeout_updated: AtomicU64,
    pub rssi_updated: AtomicU64,
    pub no_update_needed: AtomicU64,
    pub ignored_destination: AtomicU64,
    pub validation_errors: AtomicU64,
    pub storage_errors: AtomicU64,
    pub acks_published: AtomicU64,
    pub acks_failed: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub first_stored: u64,
    pub timeout_updated: u64,
    pub rssi_updated: u64,
    pub no_update_needed: u64,
    pub ignored_destination: u64,
    pub validation_errors: u64,
    pub storage_errors: u64,
    pub acks_published: u64,
    pub acks_failed: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
    pub build: &'static str,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::FirstStored => &self.first_stored,
            Outcome::TimeoutUpdated => &self.timeout_updated,
            Outcome::RssiUpdated => &self.rssi_updated,
            Outcome::NoUpdateNeeded => &self.no_update_needed,
            Outcome::IgnoredDestination => &self.ignored_destination,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_error(&self) {
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_error(&self, err: impl Into<String>) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_ack_published(&self) {
        self.acks_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_failed(&self) {
        self.acks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            first_stored: self.first_stored.load(Ordering::Relaxed),
            timeout_updated: self.timeout_updated.load(Ordering::Relaxed),
            rssi_updated: self.rssi_updated.load(Ordering::Relaxed),
            no_update_needed: self.no_update_needed.load(Ordering::Relaxed),
            ignored_destination: self.ignored_destination.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            acks_published: self.acks_published.load(Ordering::Relaxed),
            acks_failed: self.acks_failed.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
            build: env!("CARGO_PKG_VERSION"),
        }
    }
}
