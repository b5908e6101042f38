//! Prometheus metrics registry for the monitor.
//!
//! [`AppMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and pass it
//! to the monitor and the HTTP middleware.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`).

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Monitoring cycles run (scheduled and on-demand).
    pub cycles_total: Counter,
    /// Cycles that ended in an error.
    pub cycle_errors_total: Counter,
    /// Posts fetched from the post source.
    pub posts_scanned_total: Counter,
    /// Posts that matched at least one pattern or keyword.
    pub matches_found_total: Counter,
    /// Delivery attempts, labelled by outcome (`success` / `failure`).
    pub deliveries_total: CounterVec,
    /// Rows currently in the match store.
    pub stored_matches: Gauge,
    /// HTTP request count, labelled by method, path, and status code.
    pub http_requests_total: CounterVec,
    /// HTTP request latency histogram in seconds.
    pub http_request_duration: Histogram,
    /// The registry that owns all of the above metrics.
    pub registry: Registry,
}

impl AppMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cycles_total = Counter::with_opts(Opts::new(
            "xca_monitor_cycles_total",
            "Monitoring cycles run",
        ))?;

        let cycle_errors_total = Counter::with_opts(Opts::new(
            "xca_monitor_cycle_errors_total",
            "Monitoring cycles that failed",
        ))?;

        let posts_scanned_total = Counter::with_opts(Opts::new(
            "xca_monitor_posts_scanned_total",
            "Posts fetched and scanned",
        ))?;

        let matches_found_total = Counter::with_opts(Opts::new(
            "xca_monitor_matches_found_total",
            "Posts matching a pattern or keyword",
        ))?;

        let deliveries_total = CounterVec::new(
            Opts::new(
                "xca_monitor_deliveries_total",
                "Notification delivery attempts by outcome",
            ),
            &["outcome"],
        )?;

        let stored_matches = Gauge::with_opts(Opts::new(
            "xca_monitor_stored_matches",
            "Matches currently held in the database",
        ))?;

        let http_requests_total = CounterVec::new(
            Opts::new(
                "xca_monitor_http_requests_total",
                "HTTP requests by method, path, and status",
            ),
            &["method", "path", "status"],
        )?;

        let http_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "xca_monitor_http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cycle_errors_total.clone()))?;
        registry.register(Box::new(posts_scanned_total.clone()))?;
        registry.register(Box::new(matches_found_total.clone()))?;
        registry.register(Box::new(deliveries_total.clone()))?;
        registry.register(Box::new(stored_matches.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Self {
            cycles_total,
            cycle_errors_total,
            posts_scanned_total,
            matches_found_total,
            deliveries_total,
            stored_matches,
            http_requests_total,
            http_request_duration,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

/// Axum middleware recording request count and latency.
///
/// Uses the matched route template as the `path` label so ids in the URL
/// don't blow up label cardinality.
pub async fn track_http(State(metrics): State<Arc<AppMetrics>>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let started = Instant::now();
    let response = next.run(request).await;

    metrics
        .http_requests_total
        .with_label_values(&[method.as_str(), path.as_str(), response.status().as_str()])
        .inc();
    metrics
        .http_request_duration
        .observe(started.elapsed().as_secs_f64());

    response
}


#[cfg(test)]
mod integration_tests {
    use super::*;

    use axum::{
        body::Body,
        http::{Method, Request as HttpRequest},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    fn make_app(metrics: Arc<AppMetrics>) -> Router {
        Router::new()
            .route("/items/:id", get(|| async { "item" }))
            .layer(middleware::from_fn_with_state(metrics, track_http))
    }

    #[tokio::test]
    async fn middleware_records_route_template() {
        let metrics = Arc::new(AppMetrics::new().unwrap());
        let app = make_app(metrics.clone());

        let req = HttpRequest::builder()
            .method(Method::GET)
            .uri("/items/42")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 200);

        let count = metrics
            .http_requests_total
            .with_label_values(&["GET", "/items/:id", "200"])
            .get();
        assert!((count - 1.0).abs() < f64::EPSILON);
        assert_eq!(metrics.http_request_duration.get_sample_count(), 1);
    }
}
