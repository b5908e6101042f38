//! Notification destination endpoints.
//!
//! Routes:
//! - `GET    /destinations`                — primary and forwarding destinations
//! - `POST   /destinations`                — add a forwarding destination
//! - `DELETE /destinations/:chat_id`       — remove a forwarding destination
//! - `POST   /destinations/:chat_id/test`  — send a test message

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{api_error, ApiError, ApiState};
use crate::monitor::{Destination, DestinationSet};

#[derive(Debug, Deserialize)]
pub struct AddDestinationRequest {
    pub chat_id: String,
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TestDestinationResponse {
    pub chat_id: String,
    pub success: bool,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/destinations", get(list_destinations).post(add_destination))
        .route("/destinations/:chat_id", delete(remove_destination))
        .route("/destinations/:chat_id/test", post(test_destination))
}

pub async fn list_destinations(State(state): State<ApiState>) -> Json<DestinationSet> {
    Json(state.monitor.settings().destinations().await)
}

pub async fn add_destination(
    State(state): State<ApiState>,
    Json(body): Json<AddDestinationRequest>,
) -> Result<(StatusCode, Json<DestinationSet>), ApiError> {
    let chat_id = body.chat_id.trim();
    if chat_id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "chat_id must not be empty"));
    }

    let mut destination = Destination::new(chat_id);
    if let Some(label) = body.label.filter(|l| !l.trim().is_empty()) {
        destination = destination.with_label(label);
    }

    let settings = state.monitor.settings();
    if !settings.add_destination(destination).await {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("Destination {} already exists", chat_id),
        ));
    }

    tracing::info!("Added forwarding destination {}", chat_id);
    Ok((StatusCode::CREATED, Json(settings.destinations().await)))
}

pub async fn remove_destination(
    State(state): State<ApiState>,
    Path(chat_id): Path<String>,
) -> Result<Json<DestinationSet>, ApiError> {
    let settings = state.monitor.settings();
    if !settings.remove_destination(&chat_id).await {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No forwarding destination {}", chat_id),
        ));
    }

    tracing::info!("Removed forwarding destination {}", chat_id);
    Ok(Json(settings.destinations().await))
}

pub async fn test_destination(
    State(state): State<ApiState>,
    Path(chat_id): Path<String>,
) -> Result<Json<TestDestinationResponse>, ApiError> {
    let notifier = state
        .monitor
        .notifier()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "Notification sink is not configured"))?;

    let destination = state
        .monitor
        .settings()
        .destinations()
        .await
        .all()
        .into_iter()
        .find(|d| d.chat_id == chat_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown destination {}", chat_id)))?;

    let success = notifier.test_destination(&destination).await;
    Ok(Json(TestDestinationResponse { chat_id, success }))
}
