//! Monitor scheduler.
//!
//! Owns the Stopped/Running state machine. `start()` spawns one background
//! loop that runs a cycle immediately and then every check interval;
//! `stop()` cancels it through a [`CancellationToken`] and waits a bounded
//! time before aborting the loop together with any cycle still in flight. `check_now()` runs a single cycle on the caller's
//! task and leaves the loop alone.
//!
//! A [`Monitor`] is a cheap handle; clone it into the API state, the CLI,
//! and the shutdown hook.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::metrics::AppMetrics;
use crate::monitor::{
    wait_interruptibly, AccountPoller, CycleReport, CycleRunner, MatchStats, MonitorError, MonitorTiming,
    NotificationSink, Notifier, PostSource, SettingsHandle,
};
use crate::repository::{state_keys, MatchRepository};

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct MonitorInner {
    settings: SettingsHandle,
    repository: Arc<MatchRepository>,
    source: Option<Arc<dyn PostSource>>,
    sink: Option<Arc<dyn NotificationSink>>,
    metrics: Option<Arc<AppMetrics>>,
    timing: MonitorTiming,
    max_stored_matches: Option<i64>,
    running: Mutex<Option<RunningLoop>>,
    last_error: RwLock<Option<String>>,
    last_cycle_at: RwLock<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

pub struct MonitorBuilder {
    settings: SettingsHandle,
    repository: Arc<MatchRepository>,
    source: Option<Arc<dyn PostSource>>,
    sink: Option<Arc<dyn NotificationSink>>,
    metrics: Option<Arc<AppMetrics>>,
    timing: MonitorTiming,
    max_stored_matches: Option<i64>,
}

impl MonitorBuilder {
    pub fn source(mut self, source: Option<Arc<dyn PostSource>>) -> Self {
        self.source = source;
        self
    }

    pub fn sink(mut self, sink: Option<Arc<dyn NotificationSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timing(mut self, timing: MonitorTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn max_stored_matches(mut self, max: Option<i64>) -> Self {
        self.max_stored_matches = max;
        self
    }

    pub fn build(self) -> Monitor {
        Monitor {
            inner: Arc::new(MonitorInner {
                settings: self.settings,
                repository: self.repository,
                source: self.source,
                sink: self.sink,
                metrics: self.metrics,
                timing: self.timing,
                max_stored_matches: self.max_stored_matches,
                running: Mutex::new(None),
                last_error: RwLock::new(None),
                last_cycle_at: RwLock::new(None),
            }),
        }
    }
}

/// Point-in-time view of the monitor for `/status` and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub post_source_available: bool,
    pub notification_sink_available: bool,
    pub accounts: usize,
    pub regex_patterns: usize,
    pub keywords: usize,
    pub destinations: usize,
    pub check_interval_minutes: u64,
    pub last_error: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub start_time: Option<String>,
    pub uptime_seconds: Option<i64>,
    pub uptime: Option<String>,
    pub stats: Option<MatchStats>,
}

impl Monitor {
    pub fn builder(settings: SettingsHandle, repository: Arc<MatchRepository>) -> MonitorBuilder {
        MonitorBuilder {
            settings,
            repository,
            source: None,
            sink: None,
            metrics: None,
            timing: MonitorTiming::default(),
            max_stored_matches: None,
        }
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.inner.settings
    }

    pub fn repository(&self) -> &Arc<MatchRepository> {
        &self.inner.repository
    }

    /// Notifier over the configured sink, if any.
    pub fn notifier(&self) -> Option<Notifier> {
        self.inner.sink.clone().map(Notifier::new)
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.handle.is_finished())
    }

    /// Transition to Running. Succeeds without side effects if already
    /// running; fails and stays Stopped when the source, the sink, or every
    /// destination is missing.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut running = self.inner.running.lock().await;
        if running.as_ref().is_some_and(|l| !l.handle.is_finished()) {
            tracing::debug!("start() called while already running");
            return Ok(());
        }

        let runner = Arc::new(self.cycle_runner()?);
        let settings = self.inner.settings.snapshot().await;
        if settings.destinations.is_empty() {
            return Err(MonitorError::not_configured("notification destination"));
        }

        let repo = &self.inner.repository;
        repo.set_state(state_keys::RUNNING, &true).await?;
        repo.set_state(state_keys::START_TIME, &Utc::now().to_rfc3339()).await?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_loop(runner, cancel.clone()));
        *running = Some(RunningLoop { cancel, handle });
        drop(running);

        tracing::info!(
            "Monitor started: {} accounts every {} min",
            settings.monitoring.accounts.len(),
            settings.monitoring.check_interval_minutes
        );
        self.system_message(
            &format!(
                "Monitoring started. Watching {} accounts every {} minutes.",
                settings.monitoring.accounts.len(),
                settings.monitoring.check_interval_minutes
            ),
            false,
        )
        .await;

        Ok(())
    }

    /// Transition to Stopped. Succeeds without side effects if already
    /// stopped.
    ///
    /// The loop is Stopped once this returns, even when persisting the
    /// stop state fails; that failure is still reported as an error.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        let mut running = self.inner.running.lock().await;
        let Some(RunningLoop { cancel, mut handle }) = running.take() else {
            tracing::debug!("stop() called while already stopped");
            return Ok(());
        };

        cancel.cancel();
        match tokio::time::timeout(self.inner.timing.stop_timeout, &mut handle).await {
            Ok(_) => tracing::info!("Monitor loop exited"),
            Err(_) => {
                tracing::warn!(
                    "Monitor loop did not exit within {:?}; aborting",
                    self.inner.timing.stop_timeout
                );
                handle.abort();
                if let Err(err) = handle.await {
                    if !err.is_cancelled() {
                        tracing::warn!("Monitor loop ended abnormally: {}", err);
                    }
                }
            }
        }

        let persisted = self.persist_stopped().await;
        drop(running);

        self.system_message("Monitoring stopped.", false).await;

        if let Err(err) = persisted {
            tracing::error!("Failed to persist stop state: {}", err);
            return Err(err.into());
        }
        Ok(())
    }

    /// Run one cycle now, independent of the schedule.
    pub async fn check_now(&self) -> Result<CycleReport, MonitorError> {
        let runner = self.cycle_runner()?;
        let settings = self.inner.settings.snapshot().await;
        self.record(runner.run(&settings, &CancellationToken::new()).await)
            .await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().await.clone()
    }

    pub async fn status(&self) -> MonitorStatus {
        let settings = self.inner.settings.snapshot().await;
        let running = self.is_running().await;
        let repo = &self.inner.repository;

        let start_time: Option<String> = match repo.get_state(state_keys::START_TIME, None).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("Could not read start time: {}", err);
                None
            }
        };

        let uptime_seconds = running
            .then(|| start_time.as_deref())
            .flatten()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|start| (Utc::now() - start.with_timezone(&Utc)).num_seconds().max(0));

        let stats = match repo.stats().await {
            Ok(stats) => Some(stats),
            Err(err) => {
                tracing::warn!("Could not read match stats: {}", err);
                None
            }
        };

        MonitorStatus {
            running,
            post_source_available: self.inner.source.is_some(),
            notification_sink_available: self.inner.sink.is_some(),
            accounts: settings.monitoring.accounts.len(),
            regex_patterns: settings.monitoring.regex_patterns.len(),
            keywords: settings.monitoring.keywords.len(),
            destinations: settings.destinations.len(),
            check_interval_minutes: settings.monitoring.check_interval_minutes,
            last_error: self.last_error().await,
            last_cycle_at: *self.inner.last_cycle_at.read().await,
            start_time,
            uptime_seconds,
            uptime: uptime_seconds.map(format_uptime),
            stats,
        }
    }

    async fn persist_stopped(&self) -> Result<(), sqlx::Error> {
        let repo = &self.inner.repository;
        repo.set_state(state_keys::RUNNING, &false).await?;
        repo.set_state(state_keys::STOP_TIME, &Utc::now().to_rfc3339()).await
    }

    fn cycle_runner(&self) -> Result<CycleRunner, MonitorError> {
        let source = self
            .inner
            .source
            .clone()
            .ok_or_else(|| MonitorError::not_configured("post source"))?;
        let sink = self
            .inner
            .sink
            .clone()
            .ok_or_else(|| MonitorError::not_configured("notification sink"))?;

        Ok(CycleRunner::new(
            AccountPoller::new(source),
            Notifier::new(sink),
            self.inner.repository.clone(),
            self.inner.timing,
        )
        .with_metrics(self.inner.metrics.clone())
        .with_max_stored_matches(self.inner.max_stored_matches))
    }

    async fn run_loop(self, runner: Arc<CycleRunner>, cancel: CancellationToken) {
        let timing = self.inner.timing;
        // Dropping the set aborts a cycle that is still in flight, so
        // aborting this loop cannot leave one behind.
        let mut cycles = JoinSet::new();

        while !cancel.is_cancelled() {
            let settings = self.inner.settings.snapshot().await;
            let interval = std::time::Duration::from_secs(settings.monitoring.check_interval_minutes * 60);

            // Run the cycle on its own task so a panic is reported instead of
            // killing the loop.
            {
                let runner = runner.clone();
                let cancel = cancel.clone();
                cycles.spawn(async move { runner.run(&settings, &cancel).await });
            }
            let result = match cycles.join_next().await {
                Some(Ok(result)) => result,
                Some(Err(err)) => Err(MonitorError::Task {
                    message: err.to_string(),
                }),
                None => Err(MonitorError::Task {
                    message: "cycle task missing".to_string(),
                }),
            };

            let was_healthy = self.last_error().await.is_none();
            let wait = match self.record(result).await {
                Ok(_) => interval,
                Err(err) => {
                    tracing::error!(
                        "Monitoring cycle failed, retrying in {:?}: {}",
                        timing.error_backoff,
                        err
                    );
                    // Alert once per run of failures, not on every retry.
                    if was_healthy {
                        self.system_message(&format!("Monitoring cycle failed: {}", err), true)
                            .await;
                    }
                    timing.error_backoff
                }
            };

            if !wait_interruptibly(wait, timing.wait_step, &cancel).await {
                break;
            }
        }

        tracing::info!("Monitor loop stopped cleanly");
    }

    async fn record(&self, result: Result<CycleReport, MonitorError>) -> Result<CycleReport, MonitorError> {
        if let Some(metrics) = &self.inner.metrics {
            metrics.cycles_total.inc();
            if result.is_err() {
                metrics.cycle_errors_total.inc();
            }
        }

        match &result {
            Ok(_) => {
                *self.inner.last_cycle_at.write().await = Some(Utc::now());
                *self.inner.last_error.write().await = None;
            }
            Err(err) => {
                *self.inner.last_error.write().await = Some(err.to_string());
            }
        }
        result
    }

    async fn system_message(&self, text: &str, alert: bool) {
        let Some(notifier) = self.notifier() else {
            return;
        };
        let destinations = self.inner.settings.destinations().await;
        if !notifier
            .send_system_message(destinations.primary.as_ref(), text, alert)
            .await
        {
            tracing::warn!("System message not delivered: {}", text);
        }
    }
}

/// `93784` → `1d 2h 3m 4s`; leading zero units are omitted.
pub fn format_uptime(total_seconds: i64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{}d ", days));
    }
    if hours > 0 {
        out.push_str(&format!("{}h ", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m ", minutes));
    }
    out.push_str(&format!("{}s", seconds));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::MonitoringConfig;
    use crate::db::create_pool;
    use crate::monitor::{Destination, DestinationSet, MonitorSettings};
    use crate::services::mock::{make_post, MockNotificationSink, MockPostSource};

    struct Fixture {
        monitor: Monitor,
        source: Arc<MockPostSource>,
        sink: Arc<MockNotificationSink>,
        repo: Arc<MatchRepository>,
    }

    fn settings(primary: Option<Destination>) -> SettingsHandle {
        SettingsHandle::new(MonitorSettings {
            monitoring: MonitoringConfig {
                accounts: vec!["alice".into()],
                regex_patterns: vec![],
                keywords: vec!["airdrop".into()],
                check_interval_minutes: 15,
                max_posts_per_check: 20,
            },
            destinations: DestinationSet::new(primary, vec![]),
            include_post_text: true,
        })
    }

    async fn fixture(primary: Option<Destination>) -> Fixture {
        fixture_with(
            MockPostSource::new(),
            MockNotificationSink::new(),
            MonitorTiming::immediate(),
            primary,
        )
        .await
    }

    async fn fixture_with(
        source: MockPostSource,
        sink: MockNotificationSink,
        timing: MonitorTiming,
        primary: Option<Destination>,
    ) -> Fixture {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let repo = Arc::new(MatchRepository::new(pool));
        let source = Arc::new(source.with_posts("alice", vec![make_post("alice", "1", "airdrop live")]));
        let sink = Arc::new(sink);

        let monitor = Monitor::builder(settings(primary), repo.clone())
            .source(Some(source.clone() as Arc<dyn PostSource>))
            .sink(Some(sink.clone() as Arc<dyn NotificationSink>))
            .timing(timing)
            .build();

        Fixture { monitor, source, sink, repo }
    }

    fn match_deliveries(sink: &MockNotificationSink) -> usize {
        sink.deliveries()
            .iter()
            .filter(|(_, text)| text.contains("airdrop live"))
            .count()
    }

    async fn wait_for_calls(source: &MockPostSource, n: usize) {
        for _ in 0..200 {
            if source.calls().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("source was called {} times, expected {}", source.calls().len(), n);
    }

    #[tokio::test]
    async fn start_runs_a_cycle_immediately_and_persists_state() {
        let f = fixture(Some(Destination::new("@main"))).await;

        f.monitor.start().await.unwrap();
        wait_for_calls(&f.source, 1).await;

        assert!(f.monitor.is_running().await);
        let running: bool = f.repo.get_state(state_keys::RUNNING, false).await.unwrap();
        assert!(running);
        let start: Option<String> = f.repo.get_state(state_keys::START_TIME, None).await.unwrap();
        assert!(start.is_some());

        f.monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_keeps_one_loop() {
        let f = fixture(Some(Destination::new("@main"))).await;

        f.monitor.start().await.unwrap();
        f.monitor.start().await.unwrap();
        wait_for_calls(&f.source, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One loop, one immediate cycle; the next is 15 minutes away.
        assert_eq!(f.source.calls().len(), 1);
        let started = f
            .sink
            .deliveries()
            .iter()
            .filter(|(_, text)| text.contains("Monitoring started"))
            .count();
        assert_eq!(started, 1);

        f.monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_no_op() {
        let f = fixture(Some(Destination::new("@main"))).await;

        f.monitor.stop().await.unwrap();

        assert!(!f.monitor.is_running().await);
        assert!(f.sink.deliveries().is_empty());
        let stop: Option<String> = f.repo.get_state(state_keys::STOP_TIME, None).await.unwrap();
        assert!(stop.is_none());
    }

    #[tokio::test]
    async fn stop_interrupts_the_interval_wait() {
        let f = fixture(Some(Destination::new("@main"))).await;
        f.monitor.start().await.unwrap();
        wait_for_calls(&f.source, 1).await;

        let started = tokio::time::Instant::now();
        f.monitor.stop().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!f.monitor.is_running().await);
        let running: bool = f.repo.get_state(state_keys::RUNNING, true).await.unwrap();
        assert!(!running);
        let stop: Option<String> = f.repo.get_state(state_keys::STOP_TIME, None).await.unwrap();
        assert!(stop.is_some());
        assert!(f
            .sink
            .deliveries()
            .iter()
            .any(|(_, text)| text == "ℹ️ INFO: Monitoring stopped."));
    }

    #[tokio::test]
    async fn start_without_destinations_fails_and_stays_stopped() {
        let f = fixture(None).await;

        let err = f.monitor.start().await.unwrap_err();

        assert!(matches!(err, MonitorError::NotConfigured { .. }));
        assert!(!f.monitor.is_running().await);
        let running: bool = f.repo.get_state(state_keys::RUNNING, false).await.unwrap();
        assert!(!running);
    }

    #[tokio::test]
    async fn start_without_source_fails() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let repo = Arc::new(MatchRepository::new(pool));
        let monitor = Monitor::builder(settings(Some(Destination::new("@main"))), repo)
            .sink(Some(Arc::new(MockNotificationSink::new()) as Arc<dyn NotificationSink>))
            .build();

        assert!(matches!(
            monitor.start().await,
            Err(MonitorError::NotConfigured { .. })
        ));
        assert!(matches!(
            monitor.check_now().await,
            Err(MonitorError::NotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn check_now_does_not_change_state() {
        let f = fixture(Some(Destination::new("@main"))).await;

        let report = f.monitor.check_now().await.unwrap();

        assert_eq!(report.matches.len(), 1);
        assert!(!f.monitor.is_running().await);
        assert_eq!(f.repo.stats().await.unwrap().total, 1);

        let status = f.monitor.status().await;
        assert!(status.last_cycle_at.is_some());
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn failed_check_records_last_error() {
        let f = fixture(Some(Destination::new("@main"))).await;
        f.repo.pool().close().await;

        assert!(f.monitor.check_now().await.is_err());
        let status = f.monitor.status().await;
        assert!(status.last_error.unwrap().contains("Storage"));
        assert!(status.stats.is_none());
    }

    #[tokio::test]
    async fn status_reports_configuration_and_uptime() {
        let f = fixture(Some(Destination::new("@main"))).await;
        f.monitor.start().await.unwrap();
        wait_for_calls(&f.source, 1).await;

        let status = f.monitor.status().await;

        assert!(status.running);
        assert!(status.post_source_available);
        assert!(status.notification_sink_available);
        assert_eq!(status.accounts, 1);
        assert_eq!(status.keywords, 1);
        assert_eq!(status.destinations, 1);
        assert_eq!(status.check_interval_minutes, 15);
        assert!(status.uptime_seconds.is_some());
        assert!(status.uptime.unwrap().ends_with('s'));

        f.monitor.stop().await.unwrap();
        assert!(f.monitor.status().await.uptime.is_none());
    }

    #[tokio::test]
    async fn stop_timeout_aborts_a_cycle_stuck_in_a_fetch() {
        let timing = MonitorTiming {
            stop_timeout: Duration::from_millis(200),
            ..MonitorTiming::immediate()
        };
        let f = fixture_with(
            MockPostSource::new().with_delay(Duration::from_millis(1500)),
            MockNotificationSink::new(),
            timing,
            Some(Destination::new("@main")),
        )
        .await;

        f.monitor.start().await.unwrap();
        wait_for_calls(&f.source, 1).await;
        f.monitor.stop().await.unwrap();
        assert!(!f.monitor.is_running().await);

        tokio::time::sleep(Duration::from_millis(2000)).await;

        assert_eq!(f.repo.stats().await.unwrap().total, 0);
        assert_eq!(match_deliveries(&f.sink), 0);
        let running: bool = f.repo.get_state(state_keys::RUNNING, true).await.unwrap();
        assert!(!running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_checks_notify_each_destination_once() {
        let f = fixture_with(
            MockPostSource::new(),
            MockNotificationSink::new().with_delay(Duration::from_millis(50)),
            MonitorTiming::immediate(),
            Some(Destination::new("@main")),
        )
        .await;

        let (a, b) = tokio::join!(f.monitor.check_now(), f.monitor.check_now());
        a.unwrap();
        b.unwrap();

        assert_eq!(f.sink.delivered_to("@main"), 1);
        assert_eq!(f.repo.stats().await.unwrap().total, 1);
        let stored = f.repo.find_by_post_id("1").await.unwrap().unwrap();
        assert_eq!(stored.notified_destinations, vec!["@main"]);
    }

    #[tokio::test]
    async fn panicking_cycle_is_retried_after_the_backoff() {
        let timing = MonitorTiming {
            error_backoff: Duration::from_millis(100),
            ..MonitorTiming::immediate()
        };
        let f = fixture_with(
            MockPostSource::new().with_panics(1),
            MockNotificationSink::new(),
            timing,
            Some(Destination::new("@main")),
        )
        .await;

        let started = tokio::time::Instant::now();
        f.monitor.start().await.unwrap();
        wait_for_calls(&f.source, 2).await;

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(f.monitor.is_running().await);

        for _ in 0..200 {
            if f.monitor.status().await.last_cycle_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = f.monitor.status().await;
        assert!(status.last_cycle_at.is_some());
        assert!(status.last_error.is_none());
        assert_eq!(f.repo.stats().await.unwrap().total, 1);

        f.monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn loop_survives_repeated_cycle_failures() {
        let f = fixture_with(
            MockPostSource::new().with_panics(usize::MAX),
            MockNotificationSink::new(),
            MonitorTiming {
                error_backoff: Duration::from_millis(10),
                ..MonitorTiming::immediate()
            },
            Some(Destination::new("@main")),
        )
        .await;

        f.monitor.start().await.unwrap();
        wait_for_calls(&f.source, 3).await;

        assert!(f.monitor.is_running().await);
        let error = f.monitor.last_error().await.unwrap();
        assert!(error.contains("panicked"), "unexpected error: {}", error);
        assert_eq!(f.repo.stats().await.unwrap().total, 0);
        let alerts = f
            .sink
            .deliveries()
            .iter()
            .filter(|(_, text)| text.starts_with("🚨 ALERT: Monitoring cycle failed"))
            .count();
        assert_eq!(alerts, 1);

        f.monitor.stop().await.unwrap();
        assert!(!f.monitor.is_running().await);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(65), "1m 5s");
        assert_eq!(format_uptime(93_784), "1d 2h 3m 4s");
        assert_eq!(format_uptime(86_400), "1d 0s");
    }
}
