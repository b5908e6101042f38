//! Account poller.
//!
//! Wraps a [`PostSource`] and turns its errors into the three outcomes the
//! cycle cares about: posts, skip this account, or stop the batch.

use std::sync::Arc;

use crate::monitor::error::SourceError;
use crate::monitor::source::PostSource;
use crate::monitor::types::Post;

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Posts(Vec<Post>),
    /// Account could not be read this cycle; move on to the next one.
    Skipped,
    /// Provider asked us to back off; abandon the remaining accounts.
    RateLimited,
}

#[derive(Clone)]
pub struct AccountPoller {
    source: Arc<dyn PostSource>,
}

impl AccountPoller {
    pub fn new(source: Arc<dyn PostSource>) -> Self {
        Self { source }
    }

    pub async fn poll_account(&self, account: &str, max_posts: usize) -> PollOutcome {
        let account = account.trim_start_matches('@');

        match self.source.fetch_recent_posts(account, max_posts).await {
            Ok(posts) => {
                tracing::debug!("Fetched {} posts from @{}", posts.len(), account);
                PollOutcome::Posts(posts)
            }
            Err(SourceError::RateLimited) => {
                tracing::warn!("{} rate limit hit while polling @{}", self.source.source_name(), account);
                PollOutcome::RateLimited
            }
            Err(err @ (SourceError::NotFound { .. } | SourceError::Unauthorized { .. })) => {
                tracing::warn!("Skipping @{}: {}", account, err);
                PollOutcome::Skipped
            }
            Err(err) => {
                tracing::error!("Error polling @{}: {}", account, err);
                PollOutcome::Skipped
            }
        }
    }
}
