//! Monitoring pipeline: poll accounts, match posts, persist, notify.

pub mod cycle;
pub mod error;
pub mod matcher;
pub mod notifier;
pub mod poller;
pub mod settings;
pub mod source;
pub mod types;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use cycle::CycleRunner;
pub use error::{DeliveryError, MonitorError, SourceError};
pub use matcher::PatternMatcher;
pub use notifier::Notifier;
pub use poller::{AccountPoller, PollOutcome};
pub use settings::{DestinationSet, MonitorSettings, SettingsHandle};
pub use source::{NotificationSink, PostSource};
pub use types::{CycleReport, Destination, Match, MatchStats, Post, PostMatch};

/// Delays used by the monitor loop and the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTiming {
    /// Granularity of the interruptible inter-cycle wait.
    pub wait_step: Duration,
    /// Pause after a failed cycle before trying again.
    pub error_backoff: Duration,
    /// How long `stop()` waits for the loop before aborting it.
    pub stop_timeout: Duration,
    /// Pause between two accounts in the same cycle.
    pub account_delay: Duration,
    /// Pause after a rate-limit signal before the cycle gives up.
    pub rate_limit_cooldown: Duration,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            wait_step: Duration::from_secs(1),
            error_backoff: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(5),
            account_delay: Duration::from_millis(200),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

impl MonitorTiming {
    /// Zero pauses between accounts, after errors, and after rate limits.
    pub fn immediate() -> Self {
        Self {
            wait_step: Duration::from_millis(10),
            error_backoff: Duration::ZERO,
            stop_timeout: Duration::from_secs(1),
            account_delay: Duration::ZERO,
            rate_limit_cooldown: Duration::ZERO,
        }
    }
}

/// Sleep for `total` in `step`-sized increments, returning early with
/// `false` once `cancel` fires.
pub async fn wait_interruptibly(total: Duration, step: Duration, cancel: &CancellationToken) -> bool {
    let step = if step.is_zero() { total } else { step };
    let mut remaining = total;

    while !remaining.is_zero() {
        let slice = remaining.min(step);
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(slice) => {}
        }
        remaining = remaining.saturating_sub(slice);
    }

    !cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(wait_interruptibly(Duration::from_secs(5), Duration::from_secs(1), &token).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_early_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let completed = wait_interruptibly(Duration::from_secs(900), Duration::from_secs(1), &token).await;

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn zero_wait_returns_immediately() {
        let token = CancellationToken::new();
        assert!(wait_interruptibly(Duration::ZERO, Duration::ZERO, &token).await);
        token.cancel();
        assert!(!wait_interruptibly(Duration::ZERO, Duration::ZERO, &token).await);
    }
}
