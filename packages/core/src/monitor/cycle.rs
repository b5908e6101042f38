//! One poll → match → persist → notify pass.
//!
//! Accounts are processed in configured order and posts in fetch order.
//! Cancellation is only observed between accounts and inside the
//! inter-account and rate-limit pauses, so a single post is never left half
//! persisted or half delivered.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::metrics::AppMetrics;
use crate::monitor::error::MonitorError;
use crate::monitor::matcher::PatternMatcher;
use crate::monitor::notifier::Notifier;
use crate::monitor::poller::{AccountPoller, PollOutcome};
use crate::monitor::settings::MonitorSettings;
use crate::monitor::types::{CycleReport, Destination, Match, Post};
use crate::monitor::{wait_interruptibly, MonitorTiming};
use crate::repository::MatchRepository;

pub struct CycleRunner {
    poller: AccountPoller,
    notifier: Notifier,
    repository: Arc<MatchRepository>,
    metrics: Option<Arc<AppMetrics>>,
    timing: MonitorTiming,
    max_stored_matches: Option<i64>,
}

impl CycleRunner {
    pub fn new(
        poller: AccountPoller,
        notifier: Notifier,
        repository: Arc<MatchRepository>,
        timing: MonitorTiming,
    ) -> Self {
        Self {
            poller,
            notifier,
            repository,
            metrics: None,
            timing,
            max_stored_matches: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<AppMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_max_stored_matches(mut self, max: Option<i64>) -> Self {
        self.max_stored_matches = max;
        self
    }

    /// Run one cycle against `settings`.
    ///
    /// Storage failures abort the cycle with [`MonitorError::Storage`]; the
    /// affected post stays unrecorded and is picked up again next time.
    pub async fn run(
        &self,
        settings: &MonitorSettings,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, MonitorError> {
        let monitoring = &settings.monitoring;
        let matcher = PatternMatcher::compile(&monitoring.regex_patterns, &monitoring.keywords);
        let destinations = settings.destinations.all();
        let mut report = CycleReport::default();

        tracing::info!(
            "Checking {} accounts ({} patterns, {} keywords)",
            monitoring.accounts.len(),
            matcher.pattern_count(),
            matcher.keyword_count()
        );

        for (index, account) in monitoring.accounts.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!("Cycle cancelled before @{}", account);
                break;
            }
            if index > 0
                && !wait_interruptibly(self.timing.account_delay, self.timing.account_delay, cancel).await
            {
                break;
            }

            report.accounts_polled += 1;
            let posts = match self.poller.poll_account(account, monitoring.max_posts_per_check).await {
                PollOutcome::Posts(posts) => posts,
                PollOutcome::Skipped => continue,
                PollOutcome::RateLimited => {
                    report.rate_limited = true;
                    let remaining = monitoring.accounts.len() - index - 1;
                    tracing::warn!(
                        "Rate limited; cooling down {:?} and skipping {} remaining accounts",
                        self.timing.rate_limit_cooldown,
                        remaining
                    );
                    wait_interruptibly(self.timing.rate_limit_cooldown, self.timing.wait_step, cancel).await;
                    break;
                }
            };

            report.posts_scanned += posts.len();
            if let Some(metrics) = &self.metrics {
                metrics.posts_scanned_total.inc_by(posts.len() as f64);
            }

            for post in &posts {
                self.process_post(post, &matcher, &destinations, settings.include_post_text, &mut report)
                    .await?;
            }
        }

        self.enforce_retention().await;

        tracing::info!(
            "Cycle complete: {} accounts, {} posts, {} matches, {} already handled",
            report.accounts_polled,
            report.posts_scanned,
            report.matches.len(),
            report.skipped_known
        );
        Ok(report)
    }

    async fn process_post(
        &self,
        post: &Post,
        matcher: &PatternMatcher,
        destinations: &[Destination],
        include_post_text: bool,
        report: &mut CycleReport,
    ) -> Result<(), MonitorError> {
        // Held until delivery bookkeeping is done so overlapping cycles see
        // each other's notified sets.
        let _claim = self.repository.claim_post(&post.id).await;
        let existing = self.repository.find_by_post_id(&post.id).await?;

        let pending: Vec<Destination> = match &existing {
            Some(known) => destinations
                .iter()
                .filter(|d| !known.was_notified(&d.chat_id))
                .cloned()
                .collect(),
            None => destinations.to_vec(),
        };

        if existing.is_some() && pending.is_empty() {
            report.skipped_known += 1;
            return Ok(());
        }

        let Some(outcome) = matcher.match_text(&post.text) else {
            return Ok(());
        };

        let mut m = Match::from_post(post, outcome);
        if let Some(known) = &existing {
            m.created_at = known.created_at;
            m.notified_destinations = known.notified_destinations.clone();
            m.delivered = known.delivered;
        }

        let id = self.repository.store_match(&m).await?;
        m.id = Some(id);
        if let Some(metrics) = &self.metrics {
            metrics.matches_found_total.inc();
        }

        tracing::info!(
            "Match in post {} from @{}: {:?}",
            m.post_id,
            m.account,
            m.matched_patterns
        );

        let results = self.notifier.fan_out(&m, include_post_text, &pending).await;
        for (chat_id, delivered) in &results {
            if let Some(metrics) = &self.metrics {
                let outcome = if *delivered { "success" } else { "failure" };
                metrics.deliveries_total.with_label_values(&[outcome]).inc();
            }
            if *delivered {
                self.repository.mark_delivered(id, chat_id).await?;
                if !m.was_notified(chat_id) {
                    m.notified_destinations.push(chat_id.clone());
                }
                m.delivered = true;
            }
        }

        report.matches.push(m);
        Ok(())
    }

    async fn enforce_retention(&self) {
        if let Some(max) = self.max_stored_matches {
            match self.repository.trim(max).await {
                Ok(0) => {}
                Ok(deleted) => tracing::info!("Trimmed {} old matches", deleted),
                Err(err) => tracing::warn!("Failed to trim stored matches: {}", err),
            }
        }

        if let Some(metrics) = &self.metrics {
            match self.repository.stats().await {
                Ok(stats) => metrics.stored_matches.set(stats.total as f64),
                Err(err) => tracing::debug!("Could not refresh stored-matches gauge: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::MonitoringConfig;
    use crate::db::create_pool;
    use crate::monitor::error::SourceError;
    use crate::monitor::matcher::ADDRESS_PATTERN;
    use crate::monitor::settings::DestinationSet;
    use crate::services::mock::{make_post, MockNotificationSink, MockPostSource};

    const ADDR: &str = "0xABCDEF0123456789ABCDEF0123456789ABCDEF01";

    struct Harness {
        runner: CycleRunner,
        source: Arc<MockPostSource>,
        sink: Arc<MockNotificationSink>,
        repo: Arc<MatchRepository>,
    }

    async fn harness(source: MockPostSource, sink: MockNotificationSink) -> Harness {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let repo = Arc::new(MatchRepository::new(pool));
        let source = Arc::new(source);
        let sink = Arc::new(sink);
        let runner = CycleRunner::new(
            AccountPoller::new(source.clone()),
            Notifier::new(sink.clone()),
            repo.clone(),
            MonitorTiming::immediate(),
        );
        Harness { runner, source, sink, repo }
    }

    fn settings(accounts: &[&str], forwarding: Vec<Destination>) -> MonitorSettings {
        MonitorSettings {
            monitoring: MonitoringConfig {
                accounts: accounts.iter().map(|a| a.to_string()).collect(),
                regex_patterns: vec![ADDRESS_PATTERN.to_string()],
                keywords: vec!["airdrop".to_string()],
                check_interval_minutes: 15,
                max_posts_per_check: 20,
            },
            destinations: DestinationSet::new(Some(Destination::new("@main")), forwarding),
            include_post_text: true,
        }
    }

    #[tokio::test]
    async fn matching_post_is_stored_and_delivered() {
        let text = format!("free airdrop at {}", ADDR);
        let h = harness(
            MockPostSource::new().with_posts("alice", vec![make_post("alice", "1", &text)]),
            MockNotificationSink::new(),
        )
        .await;

        let report = h
            .runner
            .run(&settings(&["alice"], vec![]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.matches.len(), 1);
        let m = &report.matches[0];
        assert_eq!(m.matched_patterns, vec![ADDRESS_PATTERN, "airdrop"]);
        assert_eq!(m.extracted_values, vec![ADDR]);
        assert_eq!(h.sink.delivered_to("@main"), 1);

        let stored = h.repo.find_by_post_id("1").await.unwrap().unwrap();
        assert!(stored.delivered);
        assert_eq!(stored.notified_destinations, vec!["@main"]);
        assert_eq!(h.repo.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn same_post_next_cycle_is_not_duplicated_or_resent() {
        let text = format!("free airdrop at {}", ADDR);
        let h = harness(
            MockPostSource::new().with_posts("alice", vec![make_post("alice", "1", &text)]),
            MockNotificationSink::new(),
        )
        .await;
        let s = settings(&["alice"], vec![]);
        let token = CancellationToken::new();

        h.runner.run(&s, &token).await.unwrap();
        let second = h.runner.run(&s, &token).await.unwrap();

        assert!(second.matches.is_empty());
        assert_eq!(second.skipped_known, 1);
        assert_eq!(h.repo.stats().await.unwrap().total, 1);
        assert_eq!(h.sink.delivered_to("@main"), 1);
    }

    #[tokio::test]
    async fn non_matching_posts_are_not_stored() {
        let h = harness(
            MockPostSource::new().with_posts("alice", vec![make_post("alice", "1", "good morning")]),
            MockNotificationSink::new(),
        )
        .await;

        let report = h
            .runner
            .run(&settings(&["alice"], vec![]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.posts_scanned, 1);
        assert!(report.matches.is_empty());
        assert_eq!(h.repo.stats().await.unwrap().total, 0);
        assert!(h.sink.deliveries().is_empty());
    }

    #[tokio::test]
    async fn failed_destination_is_retried_on_next_occurrence_only() {
        let h = harness(
            MockPostSource::new().with_posts("alice", vec![make_post("alice", "1", "airdrop soon")]),
            MockNotificationSink::new().with_transport_error("A"),
        )
        .await;
        let s = settings(&["alice"], vec![Destination::new("A"), Destination::new("B")]);
        let token = CancellationToken::new();

        let first = h.runner.run(&s, &token).await.unwrap();
        let stored = h.repo.find_by_post_id("1").await.unwrap().unwrap();
        assert_eq!(first.matches[0].notified_destinations, vec!["@main", "B"]);
        assert_eq!(stored.notified_destinations, vec!["@main", "B"]);

        h.sink.recover();
        h.runner.run(&s, &token).await.unwrap();

        assert_eq!(h.sink.delivered_to("@main"), 1);
        assert_eq!(h.sink.delivered_to("B"), 1);
        assert_eq!(h.sink.delivered_to("A"), 1);
        let stored = h.repo.find_by_post_id("1").await.unwrap().unwrap();
        assert_eq!(stored.notified_destinations, vec!["@main", "B", "A"]);
        assert_eq!(h.repo.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn rate_limit_stops_remaining_accounts() {
        let source = MockPostSource::new()
            .with_posts("a1", vec![make_post("a1", "1", "airdrop one")])
            .with_posts("a2", vec![make_post("a2", "2", "airdrop two")])
            .with_error("a3", SourceError::RateLimited)
            .with_posts("a4", vec![make_post("a4", "4", "airdrop four")])
            .with_posts("a5", vec![make_post("a5", "5", "airdrop five")]);
        let h = harness(source, MockNotificationSink::new()).await;

        let report = h
            .runner
            .run(&settings(&["a1", "a2", "a3", "a4", "a5"], vec![]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.rate_limited);
        assert_eq!(h.source.calls(), vec!["a1", "a2", "a3"]);
        assert!(h.repo.find_by_post_id("1").await.unwrap().is_some());
        assert!(h.repo.find_by_post_id("2").await.unwrap().is_some());
        assert_eq!(h.repo.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn missing_accounts_do_not_abort_the_cycle() {
        let source = MockPostSource::new()
            .with_error("gone", SourceError::not_found("gone"))
            .with_posts("alice", vec![make_post("alice", "1", "airdrop")]);
        let h = harness(source, MockNotificationSink::new()).await;

        let report = h
            .runner
            .run(&settings(&["gone", "alice"], vec![]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.accounts_polled, 2);
        assert_eq!(report.matches.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_polls_nothing() {
        let h = harness(
            MockPostSource::new().with_posts("alice", vec![make_post("alice", "1", "airdrop")]),
            MockNotificationSink::new(),
        )
        .await;
        let token = CancellationToken::new();
        token.cancel();

        let report = h.runner.run(&settings(&["alice"], vec![]), &token).await.unwrap();

        assert_eq!(report.accounts_polled, 0);
        assert!(h.source.calls().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_surfaces_as_error() {
        let h = harness(
            MockPostSource::new().with_posts("alice", vec![make_post("alice", "1", "airdrop")]),
            MockNotificationSink::new(),
        )
        .await;
        h.repo.pool().close().await;

        let result = h
            .runner
            .run(&settings(&["alice"], vec![]), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(MonitorError::Storage(_))));
        assert!(h.sink.deliveries().is_empty());
    }

    #[tokio::test]
    async fn retention_trims_after_cycle() {
        let posts = (0..5)
            .map(|i| make_post("alice", &format!("p{}", i), "airdrop"))
            .collect();
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let repo = Arc::new(MatchRepository::new(pool));
        let runner = CycleRunner::new(
            AccountPoller::new(Arc::new(MockPostSource::new().with_posts("alice", posts))),
            Notifier::new(Arc::new(MockNotificationSink::new())),
            repo.clone(),
            MonitorTiming::immediate(),
        )
        .with_max_stored_matches(Some(3));

        runner
            .run(&settings(&["alice"], vec![]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(repo.stats().await.unwrap().total, 3);
    }
}
