//! Prometheus metrics for gateway observability.
//!
//! Metrics are exposed on a dedicated listener when `METRICS_PORT` is
//! non-zero. Recording functions are safe to call without an installed
//! recorder; they become no-ops.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_requests_total` - Requests leaving the pipeline (labels: outcome, status)
//! - `gateway_rate_limit_rejections_total` - Requests refused by the limiter (label: scope)
//! - `gateway_upstream_failures_total` - Failed backend calls (labels: service, kind)
//! - `gateway_state_evictions_total` - Entries removed by sweeps (label: store)
//!
//! ## Histograms
//! - `gateway_request_duration_seconds` - Time spent in the pipeline (label: outcome)
//! - `gateway_upstream_duration_seconds` - Wait for a backend response head (label: service)
//!
//! ## Gauges
//! - `gateway_rate_limit_windows` - Keys currently tracked by the limiter
//! - `gateway_active_sessions` - Sessions currently tracked

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "gateway_rate_limit_rejections_total";
    pub const UPSTREAM_FAILURES_TOTAL: &str = "gateway_upstream_failures_total";
    pub const STATE_EVICTIONS_TOTAL: &str = "gateway_state_evictions_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const UPSTREAM_DURATION_SECONDS: &str = "gateway_upstream_duration_seconds";
    pub const RATE_LIMIT_WINDOWS: &str = "gateway_rate_limit_windows";
    pub const ACTIVE_SESSIONS: &str = "gateway_active_sessions";
}

/// Install the Prometheus exporter and describe every metric.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (e.g. port in use,
/// or a recorder was already installed).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_TOTAL,
        "Requests handled by the filter pipeline"
    );
    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Requests rejected by the fixed-window rate limiter"
    );
    describe_counter!(
        names::UPSTREAM_FAILURES_TOTAL,
        "Backend calls that failed or timed out"
    );
    describe_counter!(
        names::STATE_EVICTIONS_TOTAL,
        "Expired limiter windows and sessions removed by sweeps"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Time from pipeline entry to response, in seconds"
    );
    describe_histogram!(
        names::UPSTREAM_DURATION_SECONDS,
        "Wait for a backend response head, in seconds"
    );

    describe_gauge!(
        names::RATE_LIMIT_WINDOWS,
        "Keys currently tracked by the rate limiter"
    );
    describe_gauge!(names::ACTIVE_SESSIONS, "Sessions currently tracked");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Request Pipeline
// =============================================================================

/// Record a finished request. `outcome` is the pipeline's final label
/// (`forwarded`, `unauthorized`, `rate_limited`, ...).
pub fn record_request(outcome: &'static str, status: u16, duration_secs: f64) {
    counter!(names::REQUESTS_TOTAL, "outcome" => outcome, "status" => status.to_string())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "outcome" => outcome).record(duration_secs);
}

/// `scope` is `identity` or `address`.
pub fn record_rate_limit_rejection(scope: &'static str) {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL, "scope" => scope).increment(1);
}

// =============================================================================
// Upstream
// =============================================================================

pub fn record_upstream_duration(service: &str, duration_secs: f64) {
    histogram!(names::UPSTREAM_DURATION_SECONDS, "service" => service.to_string())
        .record(duration_secs);
}

/// `kind` is `timeout` or `unreachable`.
pub fn record_upstream_failure(service: &str, kind: &'static str) {
    counter!(names::UPSTREAM_FAILURES_TOTAL, "service" => service.to_string(), "kind" => kind)
        .increment(1);
}

// =============================================================================
// State
// =============================================================================

/// `store` is `rate_limit` or `session`.
pub fn record_evictions(store: &'static str, count: usize) {
    counter!(names::STATE_EVICTIONS_TOTAL, "store" => store).increment(count as u64);
}

pub fn set_tracked_state(windows: usize, sessions: usize) {
    gauge!(names::RATE_LIMIT_WINDOWS).set(windows as f64);
    gauge!(names::ACTIVE_SESSIONS).set(sessions as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Recorders are no-ops without an installed exporter; these only check
    // that label construction does not panic.

    #[test]
    fn test_record_request() {
        record_request("forwarded", 200, 0.01);
        record_request("rate_limited", 429, 0.0001);
    }

    #[test]
    fn test_record_upstream() {
        record_upstream_duration("registration-service", 0.2);
        record_upstream_failure("registration-service", "timeout");
    }

    #[test]
    fn test_state_metrics() {
        record_rate_limit_rejection("identity");
        record_evictions("session", 3);
        set_tracked_state(10, 4);
    }
}
