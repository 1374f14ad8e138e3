use crate::report::Report;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadingKey {
    pub device_id: String,
    pub sequence_number: i64,
}

impl ReadingKey {
    pub fn new(device_id: impl Into<String>, sequence_number: i64) -> Self {
        Self {
            device_id: device_id.into(),
            sequence_number,
        }
    }
}

impl fmt::Display for ReadingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device_id, self.sequence_number)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadingRecord {
    pub device_id: String,
    pub sequence_number: i64,
    pub gateway_id: String,
    pub timestamp: i64,
    pub rssi: Option<i32>,
    pub voltages: Option<Vec<Decimal>>,
    pub temperature: Option<Decimal>,
    pub humidity: Option<Decimal>,
    pub db_update_time: DateTime<Utc>,
}

impl ReadingRecord {
    /// `db_update_time` is the ingestion clock, never the report's own timestamp.
    pub fn from_report(report: &Report, db_update_time: DateTime<Utc>) -> Self {
        Self {
            device_id: report.device_id.clone(),
            sequence_number: report.sequence_number,
            gateway_id: report.gateway_id.clone(),
            timestamp: report.timestamp,
            rssi: report.rssi,
            voltages: report.voltages.clone(),
            temperature: report.temperature,
            humidity: report.humidity,
            db_update_time,
        }
    }

    pub fn key(&self) -> ReadingKey {
        ReadingKey::new(self.device_id.clone(), self.sequence_number)
    }

    /// Copies every mutable attribute of `incoming`; the key stays.
    pub fn overwrite_with(&mut self, incoming: &ReadingRecord) {
        self.gateway_id = incoming.gateway_id.clone();
        self.timestamp = incoming.timestamp;
        self.rssi = incoming.rssi;
        self.voltages = incoming.voltages.clone();
        self.temperature = incoming.temperature;
        self.humidity = incoming.humidity;
        self.db_update_time = incoming.db_update_time;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    FirstStored,
    TimeoutUpdated,
    RssiUpdated,
    NoUpdateNeeded,
    IgnoredDestination,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::FirstStored => "first_stored",
            Outcome::TimeoutUpdated => "timeout_updated",
            Outcome::RssiUpdated => "rssi_updated",
            Outcome::NoUpdateNeeded => "no_update_needed",
            Outcome::IgnoredDestination => "ignored_destination",
        }
    }

    /// Accepting outcomes mutated storage and must be acknowledged.
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            Outcome::FirstStored | Outcome::TimeoutUpdated | Outcome::RssiUpdated
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule deciding whether a duplicate may overwrite an existing record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArbitrationPolicy {
    /// Overwrite once the reopening window has elapsed since the last accepted write.
    #[default]
    Timeout,
    /// Overwrite when the incoming signal is strictly stronger than the stored one.
    Rssi,
}

impl ArbitrationPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ArbitrationPolicy::Timeout => "timeout",
            ArbitrationPolicy::Rssi => "rssi",
        }
    }
}

impl FromStr for ArbitrationPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "timeout" => Ok(ArbitrationPolicy::Timeout),
            "rssi" => Ok(ArbitrationPolicy::Rssi),
            other => Err(format!("unknown arbitration policy {other:?}")),
        }
    }
}
