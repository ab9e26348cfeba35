//! Prometheus metrics exposition
//!
//! - `relay_requests_total` (counter): labels `status`, `method`
//! - `relay_request_duration_seconds` (histogram): label `status`
//! - `relay_rate_limited_total` (counter): upstream 429s that triggered
//!   credential rotation (incremented at the forwarding layer)
//!
//! The pool crate additionally emits `pool_penalties_total` and
//! `pool_refresh_total{outcome}`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "relay_request_duration_seconds".to_string(),
            ),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the global Prometheus recorder and return the render handle.
///
/// Explicit buckets make the duration metric render as a real histogram
/// with `_bucket` lines instead of a summary. The top buckets track the
/// default 300-second upstream timeout.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed request with status and method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("relay_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("relay_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}
