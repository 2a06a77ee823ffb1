use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Tokens currently held by the verification cache, expired ones included
    pub token_cache_entries: usize,
    /// Clients with a tracked rate limit window (None = rate limiting disabled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_clients: Option<usize>,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// The authenticated caller.
#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user_id: String,
}
