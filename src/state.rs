//! Shared application state for Axum handlers and middleware.
//!
//! Holds the single process-wide instances of:
//!
//! - **Token cache**: successful verifications, shared by every request
//! - **Rate limiter**: per-client windows (absent when disabled)
//! - **Identity verifier**: the provider client, behind a circuit breaker
//!
//! # Structured Concurrency
//!
//! Both stores run a background sweep on the state's `TaskTracker`. Call
//! `shutdown()` to stop them and wait for the tasks before application exit.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::{GuardedVerifier, HttpIdentityVerifier, IdentityVerifier};
use crate::rate_limiter::RateLimiter;
use crate::token_cache::TokenVerificationCache;

/// Shared application state.
///
/// Cloned for each request handler. All internal data is wrapped in `Arc`.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config, verifier);
/// // ... serve ...
/// state.shutdown().await;  // Stop sweeps and wait for them
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Verified token cache
    pub token_cache: Arc<TokenVerificationCache>,
    /// Per-client rate limiter, `None` when `RATE_LIMIT_MAX_REQUESTS=0`
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Identity provider used on cache misses
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
}

impl AppState {
    /// Create application state around an already-built verifier.
    ///
    /// # Background Tasks
    ///
    /// Spawns the token cache sweep and, when rate limiting is enabled, the
    /// rate limiter sweep. Must be called from within a Tokio runtime.
    pub fn new(config: Config, verifier: Arc<dyn IdentityVerifier>) -> Self {
        let task_tracker = TaskTracker::new();

        let token_cache = Arc::new(TokenVerificationCache::new(config.token_cache_ttl));
        token_cache.spawn_sweeper(config.token_cache_sweep_interval, &task_tracker);

        let rate_limiter = config.rate_limit_quota().map(|quota| {
            let limiter = Arc::new(RateLimiter::new(quota, config.rate_limit_window));
            limiter.spawn_sweeper(config.rate_limit_sweep_interval, &task_tracker);
            limiter
        });

        Self {
            config: Arc::new(config),
            token_cache,
            rate_limiter,
            verifier,
            started_at: Instant::now(),
            task_tracker,
        }
    }

    /// Create application state with the HTTP identity provider from `config`.
    ///
    /// The provider client is wrapped in a circuit breaker with a per-call
    /// deadline of `identity_verify_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the HTTP client cannot be built.
    pub fn from_config(config: Config) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.identity_verify_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;

        let verifier = GuardedVerifier::new(
            HttpIdentityVerifier::new(client, config.identity_verify_url.clone()),
            config.circuit_breaker(),
            config.identity_verify_timeout,
        );

        info!(
            url = %config.identity_verify_url,
            timeout_ms = config.identity_verify_timeout.as_millis() as u64,
            "Identity provider configured"
        );

        Ok(Self::new(config, Arc::new(verifier)))
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// 1. Signals both sweeps to stop
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete
    ///
    /// Cache and limiter stay usable afterwards; they just stop reclaiming
    /// expired entries.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.token_cache.stop();
        if let Some(limiter) = &self.rate_limiter {
            limiter.stop();
        }

        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::identity::{UserId, VerifyError};
    use async_trait::async_trait;

    struct Nobody;

    #[async_trait]
    impl IdentityVerifier for Nobody {
        async fn verify(&self, _token: &str) -> Result<UserId, VerifyError> {
            Err(VerifyError::Rejected)
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled_by_zero_quota() {
        let config = Config {
            rate_limit_max_requests: 0,
            ..Config::default()
        };
        let state = AppState::new(config, Arc::new(Nobody));

        assert!(state.rate_limiter.is_none());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_state_uses_configured_limits() {
        let config = Config {
            rate_limit_max_requests: 7,
            ..Config::default()
        };
        let state = AppState::new(config, Arc::new(Nobody));

        let limiter = state.rate_limiter.clone().unwrap();
        assert_eq!(limiter.max_requests(), 7);
        assert_eq!(state.token_cache.ttl(), state.config.token_cache_ttl);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completes_and_stores_remain_usable() {
        let state = AppState::new(Config::default(), Arc::new(Nobody));
        state.shutdown().await;

        state.token_cache.set("tok", UserId::new("u1"));
        assert_eq!(state.token_cache.get("tok"), Some(UserId::new("u1")));
        assert!(state.rate_limiter.as_ref().unwrap().allow("client"));
    }

    #[tokio::test]
    async fn test_from_config_builds_http_verifier() {
        let state = AppState::from_config(Config::default()).unwrap();
        state.shutdown().await;
    }
}
