use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::monitor::error::DeliveryError;
use crate::monitor::source::NotificationSink;

/// Telegram Bot API client used as the monitor's notification sink.
#[derive(Clone)]
pub struct TelegramClient {
    base_url: String,
    token: String,
    http: Client,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Identity returned by `getMe`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotInfo {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: String,
}

impl TelegramClient {
    pub fn new(base_url: String, token: String, timeout: Duration) -> Result<Self, DeliveryError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DeliveryError::transport(err.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Verify the token by asking the API who we are.
    pub async fn get_me(&self) -> Result<BotInfo, DeliveryError> {
        let response = self
            .http
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(|err| DeliveryError::transport(err.to_string()))?;

        let body: ApiResponse<BotInfo> = response
            .json()
            .await
            .map_err(|err| DeliveryError::invalid_response(err.to_string()))?;

        match (body.ok, body.result) {
            (true, Some(info)) => Ok(info),
            _ => Err(DeliveryError::invalid_response(
                body.description.unwrap_or_else(|| "getMe failed".to_string()),
            )),
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramClient {
    async fn deliver(&self, destination: &str, text: &str) -> Result<bool, DeliveryError> {
        let payload = SendMessage {
            chat_id: destination,
            text,
            disable_web_page_preview: true,
        };

        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await
            .map_err(|err| DeliveryError::transport(err.to_string()))?;

        let status = response.status();
        let body: ApiResponse<serde_json::Value> = response.json().await.map_err(|err| {
            DeliveryError::invalid_response(format!("HTTP {}: {}", status, err))
        })?;

        if !body.ok {
            tracing::warn!(
                "Telegram rejected message to {}: {}",
                destination,
                body.description.as_deref().unwrap_or("no description")
            );
        }
        Ok(body.ok)
    }

    fn sink_name(&self) -> &str {
        "telegram"
    }
}
