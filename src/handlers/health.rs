//! Health endpoint.
//!
//! `GET /health` is on the default auth bypass list, so load balancers can
//! probe it without a token. It is still subject to rate limiting.

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// Always returns 200 OK.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "token_cache_entries": 42,
///   "rate_limited_clients": 17,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        token_cache_entries: state.token_cache.len(),
        rate_limited_clients: state.rate_limiter.as_ref().map(|l| l.len()),
        timestamp: Utc::now(),
    })
}
