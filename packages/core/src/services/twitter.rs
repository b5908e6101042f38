use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::monitor::error::SourceError;
use crate::monitor::source::{PostSource, SourceResult};
use crate::monitor::types::Post;

/// The timeline endpoint rejects `max_results` outside this range.
const MIN_RESULTS: usize = 5;
const MAX_RESULTS: usize = 100;

/// X/Twitter API v2 client used as the monitor's post source.
#[derive(Clone)]
pub struct TwitterClient {
    base_url: String,
    bearer_token: String,
    http: Client,
    user_ids: Arc<RwLock<HashMap<String, String>>>,
}

#[derive(Debug, Deserialize)]
struct UserLookup {
    data: Option<UserData>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Timeline {
    #[serde(default)]
    data: Vec<TweetData>,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
    text: String,
}

impl TwitterClient {
    pub fn new(base_url: String, bearer_token: String, timeout: Duration) -> Result<Self, SourceError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SourceError::other(err.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
            http,
            user_ids: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Resolve `username` to a numeric user id, caching the answer.
    pub async fn resolve_user_id(&self, username: &str) -> SourceResult<String> {
        if let Some(id) = self.user_ids.read().await.get(username) {
            return Ok(id.clone());
        }

        let url = format!("{}/users/by/username/{}", self.base_url, username);
        let lookup: UserLookup = self.get_json(&url, &[], username).await?;
        let id = lookup
            .data
            .map(|user| user.id)
            .ok_or_else(|| SourceError::not_found(username))?;

        self.user_ids
            .write()
            .await
            .insert(username.to_string(), id.clone());
        Ok(id)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        account: &str,
    ) -> SourceResult<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.bearer_token)
            .query(query)
            .send()
            .await
            .map_err(|err| SourceError::other(err.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(SourceError::not_found(account)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SourceError::unauthorized(account))
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(SourceError::RateLimited),
            status => {
                return Err(SourceError::other(format!(
                    "Twitter API returned HTTP {}",
                    status
                )))
            }
        }

        response
            .json::<T>()
            .await
            .map_err(|err| SourceError::other(err.to_string()))
    }
}

#[async_trait]
impl PostSource for TwitterClient {
    async fn fetch_recent_posts(&self, account: &str, max_count: usize) -> SourceResult<Vec<Post>> {
        let username = account.trim_start_matches('@');
        let user_id = self.resolve_user_id(username).await?;

        let url = format!("{}/users/{}/tweets", self.base_url, user_id);
        let query = [
            ("max_results", max_count.clamp(MIN_RESULTS, MAX_RESULTS).to_string()),
            ("exclude", "retweets".to_string()),
        ];
        let timeline: Timeline = self.get_json(&url, &query, username).await?;

        Ok(timeline
            .data
            .into_iter()
            .take(max_count)
            .map(|tweet| Post {
                permalink: format!("https://twitter.com/{}/status/{}", username, tweet.id),
                id: tweet.id,
                account: username.to_string(),
                text: tweet.text,
            })
            .collect())
    }

    fn source_name(&self) -> &str {
        "twitter"
    }
}
