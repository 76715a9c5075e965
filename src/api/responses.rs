use crate::state::{ModelStatus, RefreshPhase};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub models_loaded: ModelStatus,
    pub refresh_phase: RefreshPhase,
    pub snapshot_available: bool,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct CurrentResponse {
    pub as_of: String,
    pub current_traffic: f64,
    pub predicted_traffic: Option<f64>,
    pub forecast_time: Option<String>,
    pub current_cluster: Option<String>,
    /// Keyed by level name.
    pub cluster_probabilities: Option<BTreeMap<String, f64>>,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct HistoryPoint {
    pub timestamp: String,
    pub traffic: f64,
    pub hour: Option<u8>,
    pub day_of_week: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub data: Vec<HistoryPoint>,
    pub count: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CurrentStatistics {
    pub traffic: f64,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct RangeStatistics {
    pub mean: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub current: CurrentStatistics,
    /// The trailing 24 hours of windows.
    pub today: RangeStatistics,
    pub all_time: RangeStatistics,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct HourlyPoint {
    pub hour: u8,
    pub mean: f64,
    pub std: Option<f64>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct WeeklyPoint {
    pub day: &'static str,
    pub day_of_week: u8,
    pub mean: f64,
    pub std: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct PatternResponse<T> {
    pub data: Vec<T>,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub error_message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoData,
    RefreshFailed,
    InternalError,
}
