//! Notification fan-out.
//!
//! Renders a match once and delivers the same text to every destination
//! independently. A failing destination is recorded as `false` and never
//! stops delivery to the rest.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::monitor::source::NotificationSink;
use crate::monitor::types::{Destination, Match};

const INFO_PREFIX: &str = "ℹ️ INFO: ";
const ALERT_PREFIX: &str = "🚨 ALERT: ";

#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Deliver `m` to each of `destinations`, returning chat id → success.
    pub async fn fan_out(
        &self,
        m: &Match,
        include_post_text: bool,
        destinations: &[Destination],
    ) -> BTreeMap<String, bool> {
        let text = m.to_message(include_post_text);
        let mut results = BTreeMap::new();

        for destination in destinations {
            let delivered = self.deliver_one(&destination.chat_id, &text).await;
            results.insert(destination.chat_id.clone(), delivered);
        }

        let successes = results.values().filter(|ok| **ok).count();
        tracing::info!(
            "Match {} from @{} delivered to {}/{} destinations",
            m.post_id,
            m.account,
            successes,
            results.len()
        );

        results
    }

    /// Best-effort status message to the primary destination only.
    pub async fn send_system_message(&self, primary: Option<&Destination>, text: &str, alert: bool) -> bool {
        let Some(primary) = primary else {
            tracing::debug!("No primary destination; system message dropped");
            return false;
        };

        let prefix = if alert { ALERT_PREFIX } else { INFO_PREFIX };
        self.deliver_one(&primary.chat_id, &format!("{}{}", prefix, text))
            .await
    }

    /// Send a short test message to confirm a destination is reachable.
    pub async fn test_destination(&self, destination: &Destination) -> bool {
        let name = destination.label.as_deref().unwrap_or(&destination.chat_id);
        let text = format!(
            "{}Test message for destination '{}'. Notifications will arrive here.",
            INFO_PREFIX, name
        );
        self.deliver_one(&destination.chat_id, &text).await
    }

    async fn deliver_one(&self, chat_id: &str, text: &str) -> bool {
        match self.sink.deliver(chat_id, text).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!("{} rejected message for {}", self.sink.sink_name(), chat_id);
                false
            }
            Err(err) => {
                tracing::error!("Delivery to {} failed: {}", chat_id, err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::types::PostMatch;
    use crate::services::mock::{make_post, MockNotificationSink};

    fn sample_match() -> Match {
        let post = make_post("alice", "1", "free airdrop");
        Match::from_post(
            &post,
            PostMatch {
                matched_patterns: vec!["airdrop".into()],
                extracted_values: vec![],
            },
        )
    }

    #[tokio::test]
    async fn failures_are_isolated_per_destination() {
        let sink = Arc::new(
            MockNotificationSink::new()
                .with_transport_error("A")
                .with_rejected("C"),
        );
        let notifier = Notifier::new(sink.clone());
        let destinations = vec![Destination::new("A"), Destination::new("B"), Destination::new("C")];

        let results = notifier.fan_out(&sample_match(), true, &destinations).await;

        assert_eq!(results.get("A"), Some(&false));
        assert_eq!(results.get("B"), Some(&true));
        assert_eq!(results.get("C"), Some(&false));
        assert_eq!(sink.delivered_to("B"), 1);
    }

    #[tokio::test]
    async fn every_destination_gets_identical_text() {
        let sink = Arc::new(MockNotificationSink::new());
        let notifier = Notifier::new(sink.clone());
        let destinations = vec![Destination::new("A"), Destination::new("B")];

        notifier.fan_out(&sample_match(), false, &destinations).await;

        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].1, deliveries[1].1);
        assert!(deliveries[0].1.starts_with("Account: @alice"));
    }

    #[tokio::test]
    async fn system_message_goes_to_primary_with_prefix() {
        let sink = Arc::new(MockNotificationSink::new());
        let notifier = Notifier::new(sink.clone());
        let primary = Destination::new("@main");

        assert!(notifier.send_system_message(Some(&primary), "started", false).await);
        assert!(notifier.send_system_message(Some(&primary), "failing", true).await);
        assert!(!notifier.send_system_message(None, "nobody", false).await);

        let deliveries = sink.deliveries();
        assert_eq!(deliveries[0], ("@main".to_string(), "ℹ️ INFO: started".to_string()));
        assert_eq!(deliveries[1].1, "🚨 ALERT: failing");
        assert_eq!(deliveries.len(), 2);
    }

    #[tokio::test]
    async fn test_destination_reports_reachability() {
        let sink = Arc::new(MockNotificationSink::new().with_rejected("bad"));
        let notifier = Notifier::new(sink);

        assert!(notifier.test_destination(&Destination::new("good").with_label("Good")).await);
        assert!(!notifier.test_destination(&Destination::new("bad")).await);
    }
}
