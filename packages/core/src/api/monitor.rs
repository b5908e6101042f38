//! Scheduler control endpoints.
//!
//! Routes:
//! - `GET  /status`         — running state, configuration counts, stats
//! - `POST /monitor/start`  — start the schedule (no-op if running)
//! - `POST /monitor/stop`   — stop the schedule (no-op if stopped)
//! - `POST /monitor/check`  — run one cycle now

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use super::{monitor_error, ApiError, ApiState};
use crate::monitor::CycleReport;
use crate::scheduler::MonitorStatus;

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub running: bool,
    pub message: String,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/status", get(status))
        .route("/monitor/start", post(start))
        .route("/monitor/stop", post(stop))
        .route("/monitor/check", post(check_now))
}

pub async fn status(State(state): State<ApiState>) -> Json<MonitorStatus> {
    Json(state.monitor.status().await)
}

pub async fn start(State(state): State<ApiState>) -> Result<Json<ControlResponse>, ApiError> {
    let was_running = state.monitor.is_running().await;
    state.monitor.start().await.map_err(monitor_error)?;

    Ok(Json(ControlResponse {
        success: true,
        running: true,
        message: if was_running {
            "Monitoring already running".to_string()
        } else {
            "Monitoring started".to_string()
        },
    }))
}

pub async fn stop(State(state): State<ApiState>) -> Result<Json<ControlResponse>, ApiError> {
    let was_running = state.monitor.is_running().await;
    state.monitor.stop().await.map_err(monitor_error)?;

    Ok(Json(ControlResponse {
        success: true,
        running: false,
        message: if was_running {
            "Monitoring stopped".to_string()
        } else {
            "Monitoring already stopped".to_string()
        },
    }))
}

pub async fn check_now(State(state): State<ApiState>) -> Result<Json<CycleReport>, ApiError> {
    let report = state.monitor.check_now().await.map_err(monitor_error)?;
    Ok(Json(report))
}
