use thiserror::Error;

use crate::config::ConfigError;
use crate::monitor::error::MonitorError;

/// Unified application error.
///
/// Everything `main` can fail on funnels through here so startup failures
/// are logged the same way whichever layer they come from.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_keep_their_message() {
        let err: AppError = ConfigError::OutOfRange {
            key: "API_PORT".into(),
            min: 1,
        }
        .into();
        assert_eq!(err.to_string(), "Config error: API_PORT must be at least 1");
    }

    #[test]
    fn monitor_errors_convert() {
        let err: AppError = MonitorError::not_configured("post source").into();
        assert!(matches!(err, AppError::Monitor(_)));
        assert!(err.to_string().contains("post source"));
    }
}
