//! Error types for the monitoring pipeline

use thiserror::Error;

/// Errors from post sources, classified so the poller can decide whether to
/// skip an account or abandon the rest of the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Account not found: {account}")]
    NotFound { account: String },

    #[error("Not authorized to read account: {account}")]
    Unauthorized { account: String },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Source error: {message}")]
    Other { message: String },
}

/// Transport-level failures from notification sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Unexpected response: {message}")]
    InvalidResponse { message: String },
}

/// Errors surfaced by the monitor scheduler and cycle runner.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Monitor is not configured: {missing}")]
    NotConfigured { missing: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Monitor task failed: {message}")]
    Task { message: String },
}

impl SourceError {
    pub fn not_found(account: impl Into<String>) -> Self {
        Self::NotFound { account: account.into() }
    }

    pub fn unauthorized(account: impl Into<String>) -> Self {
        Self::Unauthorized { account: account.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other { message: message.into() }
    }
}

impl DeliveryError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse { message: message.into() }
    }
}

impl MonitorError {
    pub fn not_configured(missing: impl Into<String>) -> Self {
        Self::NotConfigured { missing: missing.into() }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }
}
