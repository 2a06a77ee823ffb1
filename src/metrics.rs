//! Prometheus metrics for the gateway guard.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_auth_total` - Authentication outcomes (label: outcome)
//! - `gateway_token_cache_lookups_total` - Token cache lookups (label: result = hit|miss)
//! - `gateway_rate_limited_total` - Requests rejected by the rate limiter
//!
//! ## Gauges
//! - `gateway_token_cache_entries` - Entries left after the last cache sweep
//! - `gateway_rate_limiter_clients` - Client windows left after the last limiter sweep
//! - `gateway_verifier_circuit_state` - Identity provider circuit (0 = closed, 1 = half-open, 2 = open)
//!
//! Recording functions are no-ops until [`init_metrics`] installs an exporter,
//! so library users and tests can call them freely.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const AUTH_TOTAL: &str = "gateway_auth_total";
    pub const TOKEN_CACHE_LOOKUPS_TOTAL: &str = "gateway_token_cache_lookups_total";
    pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
    pub const TOKEN_CACHE_ENTRIES: &str = "gateway_token_cache_entries";
    pub const RATE_LIMITER_CLIENTS: &str = "gateway_rate_limiter_clients";
    pub const VERIFIER_CIRCUIT_STATE: &str = "gateway_verifier_circuit_state";
}

/// Authentication outcome labels.
pub mod outcome {
    pub const CACHED: &str = "cached";
    pub const VERIFIED: &str = "verified";
    pub const MISSING: &str = "missing";
    pub const MALFORMED: &str = "malformed";
    pub const REJECTED: &str = "rejected";
}

/// Install the Prometheus exporter and describe all metrics.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::AUTH_TOTAL, "Authentication outcomes by result");
    describe_counter!(
        names::TOKEN_CACHE_LOOKUPS_TOTAL,
        "Token verification cache lookups by result"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Requests rejected with 429 by the rate limiter"
    );
    describe_gauge!(
        names::TOKEN_CACHE_ENTRIES,
        "Token cache entries remaining after the last sweep"
    );
    describe_gauge!(
        names::RATE_LIMITER_CLIENTS,
        "Rate limiter client windows remaining after the last sweep"
    );
    describe_gauge!(
        names::VERIFIER_CIRCUIT_STATE,
        "Identity provider circuit state (0 = closed, 1 = half-open, 2 = open)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_auth_outcome(outcome: &'static str) {
    counter!(names::AUTH_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(names::TOKEN_CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn set_token_cache_entries(entries: usize) {
    gauge!(names::TOKEN_CACHE_ENTRIES).set(entries as f64);
}

pub fn set_rate_limiter_clients(clients: usize) {
    gauge!(names::RATE_LIMITER_CLIENTS).set(clients as f64);
}

/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_verifier_circuit_state(state: u8) {
    gauge!(names::VERIFIER_CIRCUIT_STATE).set(f64::from(state));
}

#[cfg(test)]
mod tests {
    use super::*;

    // Recording without an installed recorder must not panic.

    #[test]
    fn test_record_auth_outcomes() {
        record_auth_outcome(outcome::CACHED);
        record_auth_outcome(outcome::REJECTED);
    }

    #[test]
    fn test_record_cache_and_limiter() {
        record_cache_lookup(true);
        record_cache_lookup(false);
        record_rate_limited();
        set_token_cache_entries(3);
        set_rate_limiter_clients(7);
        set_verifier_circuit_state(2);
    }
}
