//! Prometheus metrics exposition
//!
//! Service metrics:
//!
//! - `assistant_requests_total` (counter): labels `route`, `status`
//! - `assistant_request_duration_seconds` (histogram): label `route`
//!
//! The key-pool crate adds `key_pool_rotations_total`,
//! `key_pool_failures_total` and `resilient_attempts_total` to the same
//! recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Upload handling embeds every chunk, so the top buckets reach well past a
/// single model call.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("assistant_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed request.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "assistant_requests_total",
        "route" => route,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("assistant_request_duration_seconds", "route" => route)
        .record(duration_secs);
}
