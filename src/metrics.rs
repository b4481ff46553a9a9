//! Lightweight metrics helpers for Switchyard.
//!
//! This module exposes a small set of convenience functions wrapping the
//! `metrics` crate macros. It does not embed a concrete exporter (the
//! application can install any compatible recorder) while still describing
//! the Switchyard-specific metric names.
//!
//! Provided metrics (labels vary by family):
//! * `switchyard_requests_total` (counter)
//! * `switchyard_request_duration_seconds` (histogram)
//! * `switchyard_upstream_attempts_total` (counter)
//! * `switchyard_upstream_attempt_duration_seconds` (histogram)
//! * `switchyard_retries_total` (counter)
//! * `switchyard_circuit_state` (gauge per service, 0 closed, 1 half-open, 2 open)
//! * `switchyard_circuit_rejections_total` (counter)
//! * `switchyard_rate_limited_total` (counter)
//! * `switchyard_healthy_instances` (gauge per service)
//! * `switchyard_discovery_failures_total` (counter)
use std::{collections::HashMap, sync::Mutex, time::Duration};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

use crate::core::circuit_breaker::CircuitState;

pub const SWITCHYARD_REQUESTS_TOTAL: &str = "switchyard_requests_total";
pub const SWITCHYARD_REQUEST_DURATION_SECONDS: &str = "switchyard_request_duration_seconds";
pub const SWITCHYARD_UPSTREAM_ATTEMPTS_TOTAL: &str = "switchyard_upstream_attempts_total";
pub const SWITCHYARD_UPSTREAM_ATTEMPT_DURATION_SECONDS: &str =
    "switchyard_upstream_attempt_duration_seconds";
pub const SWITCHYARD_RETRIES_TOTAL: &str = "switchyard_retries_total";
pub const SWITCHYARD_CIRCUIT_STATE: &str = "switchyard_circuit_state";
pub const SWITCHYARD_CIRCUIT_REJECTIONS_TOTAL: &str = "switchyard_circuit_rejections_total";
pub const SWITCHYARD_RATE_LIMITED_TOTAL: &str = "switchyard_rate_limited_total";
pub const SWITCHYARD_HEALTHY_INSTANCES: &str = "switchyard_healthy_instances";
pub const SWITCHYARD_DISCOVERY_FAILURES_TOTAL: &str = "switchyard_discovery_failures_total";

/// Last value written to each per-service gauge, keyed by `metric/service`
pub static SERVICE_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        SWITCHYARD_UPSTREAM_ATTEMPTS_TOTAL,
        Unit::Count,
        "Forward attempts against upstream instances, by outcome."
    );
    describe_histogram!(
        SWITCHYARD_UPSTREAM_ATTEMPT_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of individual upstream forward attempts."
    );
    describe_counter!(
        SWITCHYARD_RETRIES_TOTAL,
        Unit::Count,
        "Forward attempts beyond the first."
    );
    describe_gauge!(
        SWITCHYARD_CIRCUIT_STATE,
        "Circuit breaker state per service (0 closed, 1 half-open, 2 open)."
    );
    describe_counter!(
        SWITCHYARD_CIRCUIT_REJECTIONS_TOTAL,
        Unit::Count,
        "Requests refused because the service circuit is open."
    );
    describe_counter!(
        SWITCHYARD_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests refused by a route rate limiter."
    );
    describe_gauge!(
        SWITCHYARD_HEALTHY_INSTANCES,
        "Healthy instances in the latest registry snapshot per service."
    );
    describe_counter!(
        SWITCHYARD_DISCOVERY_FAILURES_TOTAL,
        Unit::Count,
        "Failed discovery backend lookups."
    );

    Mutex::new(HashMap::new())
});

fn set_service_gauge(metric: &'static str, service: &str, value: f64) {
    match SERVICE_GAUGES.lock() {
        Ok(mut gauges) => {
            gauges.insert(format!("{metric}/{service}"), value);
        }
        Err(_) => tracing::error!("Failed to acquire lock for service gauges"),
    }
    gauge!(metric, "service" => service.to_string()).set(value);
}

/// Record a completed inbound request.
pub fn record_request(method: &str, status: u16, duration: Duration) {
    counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record one forward attempt; `outcome` is `success` or an error kind.
pub fn record_upstream_attempt(service: &str, outcome: &str, duration: Duration) {
    counter!(
        SWITCHYARD_UPSTREAM_ATTEMPTS_TOTAL,
        "service" => service.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        SWITCHYARD_UPSTREAM_ATTEMPT_DURATION_SECONDS,
        "service" => service.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_retry(service: &str) {
    counter!(SWITCHYARD_RETRIES_TOTAL, "service" => service.to_string()).increment(1);
}

pub fn set_circuit_state(service: &str, state: CircuitState) {
    set_service_gauge(SWITCHYARD_CIRCUIT_STATE, service, state.as_gauge());
}

pub fn record_circuit_rejection(service: &str) {
    counter!(SWITCHYARD_CIRCUIT_REJECTIONS_TOTAL, "service" => service.to_string()).increment(1);
}

pub fn record_rate_limited(route: &str) {
    counter!(SWITCHYARD_RATE_LIMITED_TOTAL, "route" => route.to_string()).increment(1);
}

pub fn set_healthy_instances(service: &str, count: usize) {
    set_service_gauge(SWITCHYARD_HEALTHY_INSTANCES, service, count as f64);
}

pub fn record_discovery_failure(service: &str) {
    counter!(SWITCHYARD_DISCOVERY_FAILURES_TOTAL, "service" => service.to_string()).increment(1);
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Switchyard metrics");
    Lazy::force(&SERVICE_GAUGES);
    Ok(())
}

/// Snapshot of the per-service gauges, keyed by `metric/service`.
pub fn current_gauges() -> HashMap<String, f64> {
    SERVICE_GAUGES
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}
