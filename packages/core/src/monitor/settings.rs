//! Runtime-mutable monitor settings.
//!
//! The HTTP layer edits these while the monitor runs; each cycle works from
//! one [`SettingsHandle::snapshot`] taken at its start, so an edit lands on
//! the next cycle and never mid-way through one.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::{Config, MonitoringConfig};
use crate::monitor::error::MonitorError;
use crate::monitor::types::Destination;

/// Primary destination plus forwarding destinations, keyed by chat id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DestinationSet {
    pub primary: Option<Destination>,
    pub forwarding: Vec<Destination>,
}

impl DestinationSet {
    pub fn new(primary: Option<Destination>, forwarding: Vec<Destination>) -> Self {
        let mut set = Self {
            primary,
            forwarding: Vec::with_capacity(forwarding.len()),
        };
        for destination in forwarding {
            set.add_forwarding(destination);
        }
        set
    }

    pub fn contains(&self, chat_id: &str) -> bool {
        self.primary.as_ref().is_some_and(|p| p.chat_id == chat_id)
            || self.forwarding.iter().any(|d| d.chat_id == chat_id)
    }

    /// Add a forwarding destination. Returns `false` if the chat id is
    /// already present.
    pub fn add_forwarding(&mut self, destination: Destination) -> bool {
        if self.contains(&destination.chat_id) {
            return false;
        }
        self.forwarding.push(destination);
        true
    }

    /// Remove a forwarding destination. The primary cannot be removed.
    pub fn remove_forwarding(&mut self, chat_id: &str) -> bool {
        let before = self.forwarding.len();
        self.forwarding.retain(|d| d.chat_id != chat_id);
        self.forwarding.len() != before
    }

    /// Primary first, then forwarding destinations in insertion order.
    pub fn all(&self) -> Vec<Destination> {
        self.primary
            .iter()
            .chain(self.forwarding.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.forwarding.len() + usize::from(self.primary.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSettings {
    pub monitoring: MonitoringConfig,
    pub destinations: DestinationSet,
    pub include_post_text: bool,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            monitoring: config.monitoring.clone(),
            destinations: DestinationSet::new(
                config.telegram.primary_channel.clone(),
                config.telegram.forwarding_destinations.clone(),
            ),
            include_post_text: config.telegram.include_post_text,
        }
    }
}

/// Shared, lock-protected settings.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<MonitorSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub async fn snapshot(&self) -> MonitorSettings {
        self.inner.read().await.clone()
    }

    /// Replace the monitoring section after normalising and validating it.
    pub async fn update_monitoring(&self, monitoring: MonitoringConfig) -> Result<MonitoringConfig, MonitorError> {
        let monitoring = monitoring.normalize();
        monitoring
            .validate()
            .map_err(|e| MonitorError::invalid_config(e.to_string()))?;

        self.inner.write().await.monitoring = monitoring.clone();
        tracing::info!(
            "Monitoring settings updated: {} accounts, {} patterns, {} keywords",
            monitoring.accounts.len(),
            monitoring.regex_patterns.len(),
            monitoring.keywords.len()
        );
        Ok(monitoring)
    }

    pub async fn set_include_post_text(&self, include: bool) {
        self.inner.write().await.include_post_text = include;
    }

    pub async fn destinations(&self) -> DestinationSet {
        self.inner.read().await.destinations.clone()
    }

    pub async fn add_destination(&self, destination: Destination) -> bool {
        self.inner.write().await.destinations.add_forwarding(destination)
    }

    pub async fn remove_destination(&self, chat_id: &str) -> bool {
        self.inner.write().await.destinations.remove_forwarding(chat_id)
    }
}
