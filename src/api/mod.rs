use crate::scoring::ScoringService;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

pub mod handlers;
pub mod responses;

#[derive(Clone)]
pub struct ApiState {
    pub scoring: Arc<ScoringService>,
    /// `/api/history` window when the request names none.
    pub history_default_hours: u32,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::get_health))
        .route("/api/current", get(handlers::get_current))
        .route("/api/history", get(handlers::get_history))
        .route("/api/statistics", get(handlers::get_statistics))
        .route("/api/hourly_pattern", get(handlers::get_hourly_pattern))
        .route("/api/weekly_pattern", get(handlers::get_weekly_pattern))
        .route("/api/predict", post(handlers::post_predict))
        .with_state(state)
}
