//! Match history endpoints.
//!
//! Routes:
//! - `GET  /matches`          — recent matches, `?limit=` and `?accounts=a,b`
//! - `GET  /matches/stats`    — totals
//! - `POST /matches/cleanup`  — trim to `max_rows` (defaults to the configured cap)

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{api_error, ApiError, ApiState};
use crate::monitor::{Match, MatchStats};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 1000;
const DEFAULT_CLEANUP_ROWS: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct MatchesQuery {
    pub limit: Option<i64>,
    /// Comma-separated account names.
    pub accounts: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    pub max_rows: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: u64,
    pub max_rows: i64,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/matches", get(list_matches))
        .route("/matches/stats", get(match_stats))
        .route("/matches/cleanup", post(cleanup))
}

pub async fn list_matches(
    State(state): State<ApiState>,
    Query(params): Query<MatchesQuery>,
) -> Result<Json<Vec<Match>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {}", MAX_LIMIT),
        ));
    }

    let accounts: Vec<String> = params
        .accounts
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(|a| a.trim().trim_start_matches('@'))
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect();

    let repo = state.monitor.repository();
    let result = if accounts.is_empty() {
        repo.recent_matches(limit).await
    } else {
        repo.matches_for_accounts(&accounts, limit).await
    };

    result
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

pub async fn match_stats(State(state): State<ApiState>) -> Result<Json<MatchStats>, ApiError> {
    state
        .monitor
        .repository()
        .stats()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

pub async fn cleanup(
    State(state): State<ApiState>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let max_rows = request
        .max_rows
        .or(state.config.database.max_stored_matches)
        .unwrap_or(DEFAULT_CLEANUP_ROWS);

    if max_rows < 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "max_rows must not be negative"));
    }

    let deleted = state
        .monitor
        .repository()
        .trim(max_rows)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    tracing::info!("Cleanup removed {} matches (cap {})", deleted, max_rows);
    Ok(Json(CleanupResponse { deleted, max_rows }))
}
