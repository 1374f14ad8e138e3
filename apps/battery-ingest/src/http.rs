use crate::arbitration::{Arbiter, Outcome, ReadingRecord};
use crate::error::{IngestError, StorageError, ValidationError};
use crate::report::WireReport;
use crate::stats::StatsSnapshot;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct HttpState {
    pub arbiter: Arbiter,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        tracing::error!(error = %err, "storage error");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(err) => err.into(),
            IngestError::Storage(err) => err.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

fn outcome_status(outcome: Outcome) -> StatusCode {
    match outcome {
        Outcome::FirstStored => StatusCode::CREATED,
        Outcome::TimeoutUpdated | Outcome::RssiUpdated | Outcome::NoUpdateNeeded => StatusCode::OK,
        Outcome::IgnoredDestination => StatusCode::ACCEPTED,
    }
}

#[derive(Debug, Serialize)]
struct ReportResponse {
    status: &'static str,
}

/// Query parameters stay strings so missing or non-integer bounds map to our own 400.
#[derive(Debug, Default, Deserialize)]
struct RangeParams {
    device_id: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

struct Range {
    device_id: String,
    start: i64,
    end: i64,
}

impl RangeParams {
    fn parse(&self) -> Result<Range, ValidationError> {
        let device_id = self
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ValidationError::MissingField("device_id"))?;
        let bound = |field: &'static str, value: &Option<String>| -> Result<i64, ValidationError> {
            let raw = value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or(ValidationError::MissingField(field))?;
            raw.parse::<i64>()
                .map_err(|_| ValidationError::invalid(field, format!("{raw:?} is not an integer")))
        };
        Ok(Range {
            device_id: device_id.to_string(),
            start: bound("start", &self.start)?,
            end: bound("end", &self.end)?,
        })
    }
}

#[derive(Debug, Serialize)]
struct ReadingView {
    device_id: String,
    sequence_number: i64,
    gateway_id: String,
    timestamp: i64,
    rssi: Option<i32>,
    voltages: Option<Vec<f64>>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    db_update_time: DateTime<Utc>,
}

impl From<ReadingRecord> for ReadingView {
    fn from(record: ReadingRecord) -> Self {
        Self {
            voltages: record
                .voltages
                .map(|values| values.iter().filter_map(|v| v.to_f64()).collect()),
            temperature: record.temperature.and_then(|v| v.to_f64()),
            humidity: record.humidity.and_then(|v| v.to_f64()),
            device_id: record.device_id,
            sequence_number: record.sequence_number,
            gateway_id: record.gateway_id,
            timestamp: record.timestamp,
            rssi: record.rssi,
            db_update_time: record.db_update_time,
        }
    }
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    deleted: u64,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatsSnapshot> {
    Json(state.arbiter.stats().snapshot())
}

async fn post_report(
    State(state): State<HttpState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ReportResponse>)> {
    let mut payload = body.to_vec();
    let wire = WireReport::from_json(&mut payload).inspect_err(|_| {
        state.arbiter.stats().record_validation_error();
    })?;
    let outcome = state.arbiter.ingest(&wire).await?;
    Ok((
        outcome_status(outcome),
        Json(ReportResponse {
            status: outcome.as_str(),
        }),
    ))
}

async fn list_readings(
    State(state): State<HttpState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<Vec<ReadingView>>> {
    let range = params.parse()?;
    let records = state
        .arbiter
        .store()
        .query_by_timestamp(&range.device_id, range.start, range.end)
        .await?;
    Ok(Json(records.into_iter().map(ReadingView::from).collect()))
}

async fn delete_readings(
    State(state): State<HttpState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<DeleteResponse>> {
    let range = params.parse()?;
    let deleted = state
        .arbiter
        .store()
        .delete_sequence_range(&range.device_id, range.start, range.end)
        .await?;
    tracing::info!(
        device = %range.device_id,
        start = range.start,
        end = range.end,
        deleted,
        "deleted readings"
    );
    Ok(Json(DeleteResponse { deleted }))
}

async fn list_devices(State(state): State<HttpState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.arbiter.store().list_devices().await?))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/reports", post(post_report))
        .route("/v1/readings", get(list_readings).delete(delete_readings))
        .route("/v1/devices", get(list_devices))
        .with_state(state)
}
