//! In-process doubles for the post source and the notification sink.
//!
//! Shared by unit tests and `tests/api_integration.rs`; they record every
//! call so tests can assert on what the monitor actually did.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::monitor::error::{DeliveryError, SourceError};
use crate::monitor::source::{NotificationSink, PostSource, SourceResult};
use crate::monitor::types::Post;

/// Build a post with a twitter-style permalink.
pub fn make_post(account: &str, id: &str, text: &str) -> Post {
    Post {
        id: id.to_string(),
        account: account.to_string(),
        text: text.to_string(),
        permalink: format!("https://twitter.com/{}/status/{}", account, id),
    }
}

/// Scripted post source. Accounts without a script return no posts.
#[derive(Default)]
pub struct MockPostSource {
    scripts: Mutex<HashMap<String, SourceResult<Vec<Post>>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
    panics_left: AtomicUsize,
}

impl MockPostSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_posts(self, account: &str, posts: Vec<Post>) -> Self {
        self.set_posts(account, posts);
        self
    }

    pub fn with_error(self, account: &str, error: SourceError) -> Self {
        self.set_error(account, error);
        self
    }

    /// Sleep this long inside every fetch, after the call is recorded.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Panic inside the next `times` fetches.
    pub fn with_panics(self, times: usize) -> Self {
        self.panics_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn set_posts(&self, account: &str, posts: Vec<Post>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(account.to_string(), Ok(posts));
        }
    }

    pub fn set_error(&self, account: &str, error: SourceError) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(account.to_string(), Err(error));
        }
    }

    /// Accounts fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PostSource for MockPostSource {
    async fn fetch_recent_posts(&self, account: &str, max_count: usize) -> SourceResult<Vec<Post>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(account.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let should_panic = self
            .panics_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_panic {
            panic!("mock source asked to panic for @{}", account);
        }

        let scripted = self
            .scripts
            .lock()
            .map_err(|_| SourceError::other("mock source poisoned"))?
            .get(account)
            .cloned();

        match scripted {
            Some(Ok(mut posts)) => {
                posts.truncate(max_count);
                Ok(posts)
            }
            Some(Err(err)) => Err(err),
            None => Ok(Vec::new()),
        }
    }

    fn source_name(&self) -> &str {
        "mock"
    }
}

/// Recording sink. Destinations can be scripted to reject messages
/// (`Ok(false)`) or to fail at the transport level (`Err`).
#[derive(Default)]
pub struct MockNotificationSink {
    rejected: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    deliveries: Mutex<Vec<(String, String)>>,
    delay: Option<Duration>,
}

impl MockNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rejected(self, destination: &str) -> Self {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.insert(destination.to_string());
        }
        self
    }

    pub fn with_transport_error(self, destination: &str) -> Self {
        if let Ok(mut broken) = self.broken.lock() {
            broken.insert(destination.to_string());
        }
        self
    }

    /// Sleep this long before every delivery.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every destination deliverable again.
    pub fn recover(&self) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.clear();
        }
        if let Ok(mut broken) = self.broken.lock() {
            broken.clear();
        }
    }

    /// Successful deliveries as `(destination, text)`, in order.
    pub fn deliveries(&self) -> Vec<(String, String)> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn delivered_to(&self, destination: &str) -> usize {
        self.deliveries()
            .iter()
            .filter(|(d, _)| d == destination)
            .count()
    }
}

#[async_trait]
impl NotificationSink for MockNotificationSink {
    async fn deliver(&self, destination: &str, text: &str) -> Result<bool, DeliveryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let broken = self
            .broken
            .lock()
            .map(|b| b.contains(destination))
            .unwrap_or(false);
        if broken {
            return Err(DeliveryError::transport(format!("connection to {} refused", destination)));
        }

        let rejected = self
            .rejected
            .lock()
            .map(|r| r.contains(destination))
            .unwrap_or(false);
        if rejected {
            return Ok(false);
        }

        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push((destination.to_string(), text.to_string()));
        }
        Ok(true)
    }

    fn sink_name(&self) -> &str {
        "mock"
    }
}
