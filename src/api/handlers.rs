use crate::api::ApiState;
use crate::api::responses::{
    CurrentResponse, CurrentStatistics, ErrorCode, ErrorResponse, HealthResponse, HealthStatus,
    HistoryPoint, HistoryResponse, HourlyPoint, PatternResponse, RangeStatistics,
    StatisticsResponse, WeeklyPoint,
};
use crate::cluster::level_name;
use crate::features::{FeatureTable, VALUE_COLUMN};
use crate::scoring::RefreshError;
use crate::state::{AppState, PredictionSnapshot};
use crate::stats;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::error;

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";
const DAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];
const TODAY_WINDOWS: usize = 24;

pub enum ApiResponse<T> {
    Success(T),
    Error {
        status: StatusCode,
        body: ErrorResponse,
    },
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            ApiResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub hours: Option<u32>,
}

pub async fn get_health(State(api): State<ApiState>) -> impl IntoResponse {
    build_health_response(api.scoring.state(), OffsetDateTime::now_utc())
}

pub async fn get_current(State(api): State<ApiState>) -> impl IntoResponse {
    let snapshot = api.scoring.state().snapshot();
    build_current_response(snapshot.as_deref(), OffsetDateTime::now_utc())
}

pub async fn get_history(
    State(api): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let hours = query.hours.unwrap_or(api.history_default_hours);
    let dataset = api.scoring.state().dataset();
    build_history_response(dataset.as_deref(), hours, OffsetDateTime::now_utc())
}

pub async fn get_statistics(State(api): State<ApiState>) -> impl IntoResponse {
    let dataset = api.scoring.state().dataset();
    build_statistics_response(dataset.as_deref(), OffsetDateTime::now_utc())
}

pub async fn get_hourly_pattern(State(api): State<ApiState>) -> impl IntoResponse {
    let dataset = api.scoring.state().dataset();
    build_hourly_pattern_response(dataset.as_deref(), OffsetDateTime::now_utc())
}

pub async fn get_weekly_pattern(State(api): State<ApiState>) -> impl IntoResponse {
    let dataset = api.scoring.state().dataset();
    build_weekly_pattern_response(dataset.as_deref(), OffsetDateTime::now_utc())
}

pub async fn post_predict(State(api): State<ApiState>) -> impl IntoResponse {
    let outcome = api.scoring.refresh().await;
    build_predict_response(outcome, OffsetDateTime::now_utc())
}

fn format_timestamp(timestamp: OffsetDateTime) -> Result<String, time::error::Format> {
    timestamp.format(&Rfc3339)
}

fn internal_error<T>(message: &str) -> ApiResponse<T> {
    error!(message = message, "Internal error while handling request");
    let formatted = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
    ApiResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorResponse {
            error_code: ErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: formatted,
        },
    }
}

fn unavailable<T>(code: ErrorCode, message: String, now: OffsetDateTime) -> ApiResponse<T> {
    match format_timestamp(now) {
        Ok(timestamp) => ApiResponse::Error {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorResponse {
                error_code: code,
                error_message: message,
                timestamp,
            },
        },
        Err(_) => internal_error("timestamp formatting failure"),
    }
}

fn no_data<T>(what: &str, now: OffsetDateTime) -> ApiResponse<T> {
    unavailable(ErrorCode::NoData, format!("No {what} available"), now)
}

pub fn build_health_response(state: &AppState, now: OffsetDateTime) -> ApiResponse<HealthResponse> {
    let models = state.models();
    let snapshot_available = state.snapshot().is_some();
    let status = if models.clustering && models.forecasting && snapshot_available {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    };
    match format_timestamp(now) {
        Ok(timestamp) => ApiResponse::Success(HealthResponse {
            status,
            models_loaded: models,
            refresh_phase: state.phase(),
            snapshot_available,
            timestamp,
        }),
        Err(_) => internal_error("timestamp formatting failure"),
    }
}

fn current_body(
    snapshot: &PredictionSnapshot,
    now: OffsetDateTime,
) -> Result<CurrentResponse, time::error::Format> {
    let cluster_probabilities = snapshot.cluster_probabilities.as_ref().map(|probabilities| {
        probabilities
            .iter()
            .enumerate()
            .map(|(label, p)| (level_name(label, probabilities.len()), *p))
            .collect()
    });
    Ok(CurrentResponse {
        as_of: format_timestamp(snapshot.as_of)?,
        current_traffic: snapshot.current_value,
        predicted_traffic: snapshot.forecast_value,
        forecast_time: snapshot.forecast_time.map(format_timestamp).transpose()?,
        current_cluster: snapshot.cluster_name.clone(),
        cluster_probabilities,
        timestamp: format_timestamp(now)?,
    })
}

pub fn build_current_response(
    snapshot: Option<&PredictionSnapshot>,
    now: OffsetDateTime,
) -> ApiResponse<CurrentResponse> {
    let Some(snapshot) = snapshot else {
        return no_data("predictions", now);
    };
    match current_body(snapshot, now) {
        Ok(body) => ApiResponse::Success(body),
        Err(_) => internal_error("timestamp formatting failure"),
    }
}

pub fn build_predict_response(
    outcome: Result<Arc<PredictionSnapshot>, RefreshError>,
    now: OffsetDateTime,
) -> ApiResponse<CurrentResponse> {
    match outcome {
        Ok(snapshot) => build_current_response(Some(&snapshot), now),
        Err(err) => unavailable(ErrorCode::RefreshFailed, err.to_string(), now),
    }
}

/// Traffic values of the table, or `None` when there is nothing to report.
fn traffic(dataset: Option<&FeatureTable>) -> Option<(&FeatureTable, Vec<Option<f64>>)> {
    let table = dataset.filter(|table| !table.is_empty())?;
    let values = table.column(VALUE_COLUMN).ok()?;
    Some((table, values))
}

fn small_column(table: &FeatureTable, name: &str) -> Vec<Option<u8>> {
    match table.column(name) {
        Ok(values) => values
            .into_iter()
            .map(|value| value.and_then(|v| u8::try_from(v.round() as i64).ok()))
            .collect(),
        Err(_) => vec![None; table.len()],
    }
}

pub fn build_history_response(
    dataset: Option<&FeatureTable>,
    hours: u32,
    now: OffsetDateTime,
) -> ApiResponse<HistoryResponse> {
    let Some((table, values)) = traffic(dataset) else {
        return no_data("data", now);
    };
    // A span reaching past the calendar's start keeps every row.
    let cutoff = now.checked_sub(Duration::hours(i64::from(hours)));
    let hour = small_column(table, "hour");
    let day_of_week = small_column(table, "day_of_week");

    let mut data = Vec::new();
    for (index, row) in table.rows().iter().enumerate() {
        if cutoff.is_some_and(|cutoff| row.timestamp < cutoff) {
            continue;
        }
        let Some(traffic) = values[index] else {
            continue;
        };
        let Ok(timestamp) = format_timestamp(row.timestamp) else {
            return internal_error("timestamp formatting failure");
        };
        data.push(HistoryPoint {
            timestamp,
            traffic,
            hour: hour[index],
            day_of_week: day_of_week[index],
        });
    }
    match format_timestamp(now) {
        Ok(timestamp) => ApiResponse::Success(HistoryResponse {
            count: data.len(),
            data,
            timestamp,
        }),
        Err(_) => internal_error("timestamp formatting failure"),
    }
}

pub fn build_statistics_response(
    dataset: Option<&FeatureTable>,
    now: OffsetDateTime,
) -> ApiResponse<StatisticsResponse> {
    let Some((table, values)) = traffic(dataset) else {
        return no_data("data", now);
    };
    let (Some(latest), Some(Some(current))) = (table.last(), values.last()) else {
        return no_data("current traffic", now);
    };
    let all: Vec<f64> = values.iter().flatten().copied().collect();
    let today: Vec<f64> = values
        .iter()
        .skip(values.len().saturating_sub(TODAY_WINDOWS))
        .flatten()
        .copied()
        .collect();

    let (Ok(latest_time), Ok(timestamp)) =
        (format_timestamp(latest.timestamp), format_timestamp(now))
    else {
        return internal_error("timestamp formatting failure");
    };
    ApiResponse::Success(StatisticsResponse {
        current: CurrentStatistics {
            traffic: *current,
            timestamp: latest_time,
        },
        today: RangeStatistics {
            mean: stats::mean(&today),
            max: stats::max(&today),
            min: stats::min(&today),
            std: None,
        },
        all_time: RangeStatistics {
            mean: stats::mean(&all),
            max: stats::max(&all),
            min: stats::min(&all),
            std: stats::sample_std(&all),
        },
        timestamp,
    })
}

/// Mean and sample std of traffic grouped by a small integer column.
fn grouped(table: &FeatureTable, values: &[Option<f64>], column: &str) -> BTreeMap<u8, Vec<f64>> {
    let mut groups: BTreeMap<u8, Vec<f64>> = BTreeMap::new();
    for (key, value) in small_column(table, column).into_iter().zip(values) {
        if let (Some(key), Some(value)) = (key, value) {
            groups.entry(key).or_default().push(*value);
        }
    }
    groups
}

pub fn build_hourly_pattern_response(
    dataset: Option<&FeatureTable>,
    now: OffsetDateTime,
) -> ApiResponse<PatternResponse<HourlyPoint>> {
    let Some((table, values)) = traffic(dataset) else {
        return no_data("data", now);
    };
    let data: Vec<HourlyPoint> = grouped(table, &values, "hour")
        .into_iter()
        .filter_map(|(hour, group)| {
            Some(HourlyPoint {
                hour,
                mean: stats::mean(&group)?,
                std: stats::sample_std(&group),
            })
        })
        .collect();
    if data.is_empty() {
        return no_data("hourly pattern", now);
    }
    match format_timestamp(now) {
        Ok(timestamp) => ApiResponse::Success(PatternResponse { data, timestamp }),
        Err(_) => internal_error("timestamp formatting failure"),
    }
}

pub fn build_weekly_pattern_response(
    dataset: Option<&FeatureTable>,
    now: OffsetDateTime,
) -> ApiResponse<PatternResponse<WeeklyPoint>> {
    let Some((table, values)) = traffic(dataset) else {
        return no_data("data", now);
    };
    let data: Vec<WeeklyPoint> = grouped(table, &values, "day_of_week")
        .into_iter()
        .filter_map(|(day_of_week, group)| {
            Some(WeeklyPoint {
                day: *DAY_NAMES.get(usize::from(day_of_week))?,
                day_of_week,
                mean: stats::mean(&group)?,
                std: stats::sample_std(&group),
            })
        })
        .collect();
    if data.is_empty() {
        return no_data("weekly pattern", now);
    }
    match format_timestamp(now) {
        Ok(timestamp) => ApiResponse::Success(PatternResponse { data, timestamp }),
        Err(_) => internal_error("timestamp formatting failure"),
    }
}
