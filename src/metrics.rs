//! Prometheus metrics for the service.
//!
//! Every collector lives in a [`Metrics`] registry owned by the process,
//! so tests can build isolated instances.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::Result;
use crate::ratelimit::{DecisionEvent, DecisionObserver, Policy};

/// Latency buckets in seconds, shared by both histograms.
pub const LATENCY_BUCKETS: [f64; 9] = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Collectors exported on `/metrics`.
pub struct Metrics {
    registry: Registry,
    /// Labels: `tenant_id`, `route`, `result` (`allowed` or `blocked`)
    pub evaluate_total: IntCounterVec,
    /// Labels: `tenant_id`, `algorithm`
    pub policies_total: IntCounterVec,
    /// Labels: `method`, `endpoint`, `status`
    pub http_requests_total: IntCounterVec,
    /// Labels: `tenant_id`
    pub evaluate_duration: HistogramVec,
    /// Labels: `method`, `endpoint`
    pub http_request_duration: HistogramVec,
}

impl Metrics {
    /// Create the collectors and register them in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let evaluate_total = IntCounterVec::new(
            Opts::new(
                "throttlex_evaluate_total",
                "Total number of rate limit evaluations",
            ),
            &["tenant_id", "route", "result"],
        )?;
        let policies_total = IntCounterVec::new(
            Opts::new("throttlex_policies_total", "Total number of policies created"),
            &["tenant_id", "algorithm"],
        )?;
        let http_requests_total = IntCounterVec::new(
            Opts::new("throttlex_http_requests_total", "Total HTTP requests"),
            &["method", "endpoint", "status"],
        )?;
        let evaluate_duration = HistogramVec::new(
            HistogramOpts::new(
                "throttlex_evaluate_duration_seconds",
                "Duration of rate limit evaluations",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["tenant_id"],
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "throttlex_http_request_duration_seconds",
                "Duration of HTTP requests",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["method", "endpoint"],
        )?;

        registry.register(Box::new(evaluate_total.clone()))?;
        registry.register(Box::new(policies_total.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(evaluate_duration.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Self {
            registry,
            evaluate_total,
            policies_total,
            http_requests_total,
            evaluate_duration,
            http_request_duration,
        })
    }

    /// Count one answered HTTP request.
    pub fn observe_http(&self, method: &str, endpoint: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, endpoint, status.as_str()])
            .inc();
        self.http_request_duration
            .with_label_values(&[method, endpoint])
            .observe(elapsed.as_secs_f64());
    }

    /// Content type of [`Metrics::encode`] output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Render every collector in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

/// Feeds evaluation outcomes and policy saves into [`Metrics`].
pub struct PrometheusObserver {
    metrics: Arc<Metrics>,
}

impl PrometheusObserver {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl DecisionObserver for PrometheusObserver {
    fn on_decision(&self, event: &DecisionEvent) {
        let result = if event.decision.allow { "allowed" } else { "blocked" };

        self.metrics
            .evaluate_total
            .with_label_values(&[event.tenant_id.as_str(), event.route.as_str(), result])
            .inc();
        self.metrics
            .evaluate_duration
            .with_label_values(&[event.tenant_id.as_str()])
            .observe(event.elapsed.as_secs_f64());
    }

    fn on_policy_saved(&self, policy: &Policy) {
        self.metrics
            .policies_total
            .with_label_values(&[policy.tenant_id.as_str(), policy.algorithm.as_str()])
            .inc();
    }
}
