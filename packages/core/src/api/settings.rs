//! Configuration endpoints.
//!
//! Routes:
//! - `GET /config`             — effective configuration, secrets masked
//! - `PUT /config/monitoring`  — partial update of the monitoring section

use axum::{
    extract::State,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{monitor_error, ApiError, ApiState};
use crate::config::{mask_secret, MonitoringConfig};
use crate::monitor::DestinationSet;

#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub twitter: TwitterView,
    pub telegram: TelegramView,
    pub database: DatabaseView,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Serialize)]
pub struct TwitterView {
    pub bearer_token: Option<String>,
    pub api_url: String,
}

#[derive(Debug, Serialize)]
pub struct TelegramView {
    pub bot_token: Option<String>,
    pub include_post_text: bool,
    pub destinations: DestinationSet,
}

#[derive(Debug, Serialize)]
pub struct DatabaseView {
    pub url: String,
    pub max_stored_matches: Option<i64>,
}

/// Fields left out keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct MonitoringUpdate {
    pub accounts: Option<Vec<String>>,
    pub regex_patterns: Option<Vec<String>>,
    pub keywords: Option<Vec<String>>,
    pub check_interval_minutes: Option<u64>,
    pub max_posts_per_check: Option<usize>,
    pub include_post_text: Option<bool>,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/config", get(get_config))
        .route("/config/monitoring", put(update_monitoring))
}

pub async fn get_config(State(state): State<ApiState>) -> Json<ConfigView> {
    let settings = state.monitor.settings().snapshot().await;
    let config = &state.config;

    Json(ConfigView {
        twitter: TwitterView {
            bearer_token: config.twitter.bearer_token.as_deref().map(mask_secret),
            api_url: config.twitter.api_url.clone(),
        },
        telegram: TelegramView {
            bot_token: config.telegram.bot_token.as_deref().map(mask_secret),
            include_post_text: settings.include_post_text,
            destinations: settings.destinations,
        },
        database: DatabaseView {
            url: config.database.url.clone(),
            max_stored_matches: config.database.max_stored_matches,
        },
        monitoring: settings.monitoring,
    })
}

pub async fn update_monitoring(
    State(state): State<ApiState>,
    Json(update): Json<MonitoringUpdate>,
) -> Result<Json<MonitoringConfig>, ApiError> {
    let handle = state.monitor.settings();
    let current = handle.snapshot().await.monitoring;

    let merged = MonitoringConfig {
        accounts: update.accounts.unwrap_or(current.accounts),
        regex_patterns: update.regex_patterns.unwrap_or(current.regex_patterns),
        keywords: update.keywords.unwrap_or(current.keywords),
        check_interval_minutes: update
            .check_interval_minutes
            .unwrap_or(current.check_interval_minutes),
        max_posts_per_check: update.max_posts_per_check.unwrap_or(current.max_posts_per_check),
    };

    let applied = handle.update_monitoring(merged).await.map_err(monitor_error)?;
    if let Some(include) = update.include_post_text {
        handle.set_include_post_text(include).await;
    }

    Ok(Json(applied))
}
