//! Lightweight metrics helpers for Vaultgate.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. It intentionally avoids embedding a
//! concrete exporter (the application can initialize any compatible recorder
//! externally) while still documenting and describing Vaultgate-specific
//! metric names.
//!
//! Provided metrics (labels vary by family):
//! * `vaultgate_requests_total` (counter)
//! * `vaultgate_request_duration_seconds` (histogram)
//! * `vaultgate_backend_requests_total` (counter)
//! * `vaultgate_backend_request_duration_seconds` (histogram)
//!
//! Request metrics are labelled with the matched route pattern, never the
//! raw URI, so path parameters cannot blow up label cardinality. Backend
//! metrics are labelled with the logical operation for the same reason.
//!
//! The `*Timer` structs leverage `Drop` to record durations safely even when
//! early returns or errors occur.
use std::time::Instant;

use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::Lazy;

// Vaultgate-specific metric names
pub const VAULTGATE_REQUESTS_TOTAL: &str = "vaultgate_requests_total";
pub const VAULTGATE_REQUEST_DURATION_SECONDS: &str = "vaultgate_request_duration_seconds";
pub const VAULTGATE_BACKEND_REQUESTS_TOTAL: &str = "vaultgate_backend_requests_total";
pub const VAULTGATE_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "vaultgate_backend_request_duration_seconds";

/// One-time registration of metric descriptions.
static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        VAULTGATE_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests answered by the service."
    );
    describe_histogram!(
        VAULTGATE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests answered by the service."
    );
    describe_counter!(
        VAULTGATE_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests made to the secrets backend."
    );
    describe_histogram!(
        VAULTGATE_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests made to the secrets backend."
    );
});

/// Increment the total request counter for an answered request.
pub fn increment_request_total(route: &str, method: &str, status: u16) {
    counter!(
        VAULTGATE_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed request's duration.
pub fn record_request_duration(route: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        VAULTGATE_REQUEST_DURATION_SECONDS,
        "route" => route.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count a completed backend call. `outcome` is the HTTP status, or
/// `transport_error` when the call never produced one.
pub fn increment_backend_request_total(operation: &str, outcome: &str) {
    counter!(
        VAULTGATE_BACKEND_REQUESTS_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a completed backend call's duration.
pub fn record_backend_request_duration(operation: &str, duration: std::time::Duration) {
    histogram!(
        VAULTGATE_BACKEND_REQUEST_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    route: String,
    method: String,
}

impl RequestTimer {
    pub fn new(route: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            route: route.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.route, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring a backend call's duration.
pub struct BackendOpTimer {
    start: Instant,
    operation: &'static str,
}

impl BackendOpTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for BackendOpTimer {
    fn drop(&mut self) {
        record_backend_request_duration(self.operation, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIPTIONS);
    tracing::debug!("metrics descriptions registered");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timer() {
        let timer = RequestTimer::new("/api/health", "GET");
        // Timer will record duration when dropped
        drop(timer);
    }

    #[test]
    fn test_backend_op_timer() {
        let timer = BackendOpTimer::new("renew_self");
        // Timer will record duration when dropped
        drop(timer);
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
    }
}
