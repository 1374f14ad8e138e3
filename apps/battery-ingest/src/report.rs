use crate::error::ValidationError;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

pub const DESTINATION_SERVER: &str = "server";
pub const DESTINATION_PING: &str = "ping";

/// Sequence number every ping collapses onto.
pub const PING_SEQUENCE_NUMBER: i64 = 0;

/// Report exactly as a gateway relayed it. Nothing is trusted until [`WireReport::normalize`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireReport {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<WireNumber>,
    #[serde(default)]
    pub timestamp: Option<WireNumber>,
    #[serde(default)]
    pub rssi: Option<WireNumber>,
    #[serde(default)]
    pub voltages: Option<Vec<WireNumber>>,
    #[serde(default)]
    pub temperature: Option<WireNumber>,
    #[serde(default)]
    pub humidity: Option<WireNumber>,
}

/// Gateways send numbers either as JSON numbers or as their textual form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    Number(serde_json::Number),
    Text(String),
}

#[cfg(test)]
impl From<i64> for WireNumber {
    fn from(value: i64) -> Self {
        WireNumber::Number(value.into())
    }
}

#[cfg(test)]
impl From<&str> for WireNumber {
    fn from(value: &str) -> Self {
        WireNumber::Text(value.to_string())
    }
}

impl WireNumber {
    fn to_integer(&self, field: &'static str) -> Result<i64, ValidationError> {
        match self {
            WireNumber::Number(n) => n
                .as_i64()
                .ok_or_else(|| ValidationError::invalid(field, format!("expected an integer, got {n}"))),
            WireNumber::Text(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| ValidationError::invalid(field, format!("expected an integer, got {raw:?}"))),
        }
    }

    // Floats go through their shortest round-trip text, so 3.30 on the wire is stored as 3.3
    // and never as 3.29999999999999982236431605997495353221893310546875.
    fn to_decimal(&self, field: &'static str) -> Result<Decimal, ValidationError> {
        let text = match self {
            WireNumber::Number(n) => n.to_string(),
            WireNumber::Text(raw) => raw.trim().to_string(),
        };
        if !is_decimal_literal(&text) {
            return Err(ValidationError::invalid(
                field,
                format!("expected a decimal, got {text:?}"),
            ));
        }
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|_| ValidationError::invalid(field, format!("expected a decimal, got {text:?}")))
    }
}

/// Optional sign, digits with at most one point, optional exponent. `Decimal::from_str` alone
/// would also take digit-group underscores.
fn is_decimal_literal(text: &str) -> bool {
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    let unsigned = text.strip_prefix(|c| c == '+' || c == '-').unwrap_or(text);
    let (mantissa, exponent) = match unsigned.find(|c| c == 'e' || c == 'E') {
        Some(idx) => (&unsigned[..idx], Some(&unsigned[idx + 1..])),
        None => (unsigned, None),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if (int.is_empty() && frac.is_empty()) || !all_digits(int) || !all_digits(frac) {
        return false;
    }
    match exponent {
        None => true,
        Some(exp) => {
            let exp = exp.strip_prefix(|c| c == '+' || c == '-').unwrap_or(exp);
            !exp.is_empty() && all_digits(exp)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Server,
    Ping,
    Other(String),
}

impl Destination {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            DESTINATION_SERVER => Destination::Server,
            DESTINATION_PING => Destination::Ping,
            other => Destination::Other(other.to_string()),
        }
    }
}

/// A report that passed validation and carries exact numeric types.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub destination: Destination,
    pub gateway_id: String,
    pub device_id: String,
    pub sequence_number: i64,
    pub timestamp: i64,
    pub rssi: Option<i32>,
    pub voltages: Option<Vec<Decimal>>,
    pub temperature: Option<Decimal>,
    pub humidity: Option<Decimal>,
}

/// Required fields of a [`WireReport`], present and non-blank.
#[derive(Debug)]
pub struct RequiredFields<'a> {
    pub destination: Destination,
    pub gateway_id: &'a str,
    pub device_id: &'a str,
    sequence_number: &'a WireNumber,
    timestamp: &'a WireNumber,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl WireReport {
    /// Decodes one JSON report in place. A body that is not a JSON object is a validation
    /// failure like any other malformed field.
    pub fn from_json(payload: &mut [u8]) -> Result<Self, ValidationError> {
        simd_json::serde::from_slice(payload)
            .map_err(|err| ValidationError::invalid("payload", err.to_string()))
    }

    /// Checks the required fields in a fixed order; the first absent one is reported.
    pub fn check_required(&self) -> Result<RequiredFields<'_>, ValidationError> {
        let destination =
            non_empty(&self.destination).ok_or(ValidationError::MissingField("destination"))?;
        let gateway_id =
            non_empty(&self.gateway_id).ok_or(ValidationError::MissingField("gateway_id"))?;
        let device_id =
            non_empty(&self.device_id).ok_or(ValidationError::MissingField("device_id"))?;
        let sequence_number = self
            .sequence_number
            .as_ref()
            .ok_or(ValidationError::MissingField("sequence_number"))?;
        let timestamp = self
            .timestamp
            .as_ref()
            .ok_or(ValidationError::MissingField("timestamp"))?;
        Ok(RequiredFields {
            destination: Destination::parse(destination),
            gateway_id,
            device_id,
            sequence_number,
            timestamp,
        })
    }

    pub fn normalize(&self) -> Result<Report, ValidationError> {
        let required = self.check_required()?;
        let destination = required.destination;
        let gateway_id = required.gateway_id.to_string();
        let device_id = required.device_id.to_string();
        let timestamp = required.timestamp.to_integer("timestamp")?;

        let rssi = self
            .rssi
            .as_ref()
            .map(|raw| {
                let value = raw.to_integer("rssi")?;
                i32::try_from(value)
                    .map_err(|_| ValidationError::invalid("rssi", format!("{value} out of range")))
            })
            .transpose()?;

        if destination == Destination::Ping {
            return Ok(Report {
                destination,
                gateway_id,
                device_id,
                sequence_number: PING_SEQUENCE_NUMBER,
                timestamp,
                rssi,
                voltages: None,
                temperature: None,
                humidity: None,
            });
        }

        let sequence_number = required.sequence_number.to_integer("sequence_number")?;
        if sequence_number < 0 {
            return Err(ValidationError::invalid(
                "sequence_number",
                format!("{sequence_number} is negative"),
            ));
        }

        let voltages = self
            .voltages
            .as_ref()
            .map(|samples| {
                samples
                    .iter()
                    .map(|sample| sample.to_decimal("voltages"))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let temperature = self
            .temperature
            .as_ref()
            .map(|raw| raw.to_decimal("temperature"))
            .transpose()?;
        let humidity = self
            .humidity
            .as_ref()
            .map(|raw| raw.to_decimal("humidity"))
            .transpose()?;

        Ok(Report {
            destination,
            gateway_id,
            device_id,
            sequence_number,
            timestamp,
            rssi,
            voltages,
            temperature,
            humidity,
        })
    }
}
