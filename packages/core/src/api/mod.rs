//! HTTP API.
//!
//! Every route shares one [`ApiState`]; the monitor handle inside it is the
//! only way handlers reach the scheduler, the store, or the settings.

pub mod destinations;
pub mod health;
pub mod matches;
pub mod monitor;
pub mod settings;

use std::fmt::Display;
use std::sync::Arc;

use axum::{http::StatusCode, middleware, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::metrics::{track_http, AppMetrics};
use crate::monitor::MonitorError;
use crate::scheduler::Monitor;

#[derive(Clone)]
pub struct ApiState {
    pub monitor: Monitor,
    pub metrics: Arc<AppMetrics>,
    pub config: Arc<Config>,
}

/// Error shape shared by all handlers: status plus `{"error": "..."}`.
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: impl Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

pub(crate) fn monitor_error(err: MonitorError) -> ApiError {
    let status = match &err {
        MonitorError::NotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
        MonitorError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
        MonitorError::Storage(_) | MonitorError::Task { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err)
}

/// Assemble the full router.
pub fn create_router(state: ApiState) -> Router {
    let metrics = state.metrics.clone();

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .merge(monitor::routes())
        .merge(matches::routes())
        .merge(settings::routes())
        .merge(destinations::routes())
        .layer(middleware::from_fn_with_state(metrics, track_http))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
