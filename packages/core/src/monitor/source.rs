//! Post source and notification sink interfaces
//!
//! Keeps the monitor independent of the social-media and chat APIs behind
//! them.

use async_trait::async_trait;

use crate::monitor::{
    error::{DeliveryError, SourceError},
    types::Post,
};

/// Result type for post source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Something that can list the most recent posts of an account.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Fetch up to `max_count` of the most recent non-reshare posts for
    /// `account`, newest first.
    async fn fetch_recent_posts(&self, account: &str, max_count: usize) -> SourceResult<Vec<Post>>;

    /// Name of this source for logging/debugging
    fn source_name(&self) -> &str;
}

/// Something that can deliver a text message to a chat.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `text` to `destination`.
    ///
    /// `Ok(false)` means the sink reached the service but the message was
    /// rejected; `Err` means the transport itself failed.
    async fn deliver(&self, destination: &str, text: &str) -> Result<bool, DeliveryError>;

    fn sink_name(&self) -> &str;
}
