//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("meridian_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "meridian_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ENTITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("meridian_entities_received_total", "Total number of federated entities accepted at the inbox"),
        &["entity_type"]
    ).expect("metric can be created");
    pub static ref ENTITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("meridian_entities_sent_total", "Total number of federated entities delivered"),
        &["entity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("meridian_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "meridian_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("meridian_signature_verifications_total", "Signature verification results"),
        &["result"]
    ).expect("metric can be created");
    pub static ref RESOLVER_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("meridian_resolver_lookups_total", "Entity resolver lookups by source"),
        &["source"]
    ).expect("metric can be created");

    // Queue Metrics
    pub static ref QUEUE_JOBS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("meridian_queue_jobs_total", "Queue jobs by terminal or retry outcome"),
        &["queue", "outcome"]
    ).expect("metric can be created");
    pub static ref QUEUE_JOB_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "meridian_queue_job_duration_seconds",
            "Queue job execution time in seconds"
        ).buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["queue"]
    ).expect("metric can be created");
    pub static ref QUEUE_WORKERS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("meridian_queue_workers_active", "Workers currently executing a job"),
        &["queue"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("meridian_errors_total", "Total number of errors returned over HTTP"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Safe to call more than once; duplicate registrations are ignored.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()),
        Box::new(ENTITIES_RECEIVED.clone()),
        Box::new(ENTITIES_SENT.clone()),
        Box::new(FEDERATION_REQUESTS_TOTAL.clone()),
        Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
        Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone()),
        Box::new(RESOLVER_LOOKUPS_TOTAL.clone()),
        Box::new(QUEUE_JOBS_TOTAL.clone()),
        Box::new(QUEUE_JOB_DURATION_SECONDS.clone()),
        Box::new(QUEUE_WORKERS_ACTIVE.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::debug!(%error, "Metric already registered");
        }
    }

    tracing::info!("Metrics registry initialized");
}

/// Record the outcome of one queue job execution.
pub fn observe_job(queue: &str, outcome: &str, elapsed: Duration) {
    QUEUE_JOBS_TOTAL.with_label_values(&[queue, outcome]).inc();
    QUEUE_JOB_DURATION_SECONDS
        .with_label_values(&[queue])
        .observe(elapsed.as_secs_f64());
}
