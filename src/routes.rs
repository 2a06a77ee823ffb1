//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (applied in order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 + Retry-After if exceeded
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Authentication  │ ← 401 if missing/invalid (bypassed for /health)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Body Limit     │
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `GET /health` - Health check (auth bypassed)
//! - `GET /me` - Authenticated principal

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{AuthLayer, RateLimitLayer, TrustedProxies};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/me", get(handlers::me));

    apply_guards(router, &state).with_state(state)
}

/// Wrap `router` in the body limit, tracing, auth and rate limit layers.
///
/// Works for any router state, so embedding applications can guard their
/// own routes with the instances held by `state`.
pub fn apply_guards<S>(router: Router<S>, state: &AppState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let config = &state.config;

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit
    info!(
        max_size_bytes = config.max_request_body_size,
        "Request body size limit configured"
    );
    let mut router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Tracing
    router = router.layer(TraceLayer::new_for_http());

    // 3. Authentication
    router = router.layer(
        AuthLayer::new(state.verifier.clone(), state.token_cache.clone())
            .with_bypass_paths(config.auth_bypass_paths.clone()),
    );
    info!(
        bypass_paths = ?config.auth_bypass_paths,
        cache_ttl_secs = config.token_cache_ttl.as_secs(),
        "Bearer authentication enabled"
    );

    // 4. Rate Limiting (if enabled) - applied last, runs first in request pipeline
    match &state.rate_limiter {
        Some(limiter) => {
            info!(
                max_requests = limiter.max_requests(),
                window_secs = limiter.window().as_secs(),
                trusted_proxies = config.trusted_proxies.len(),
                "Rate limiting enabled"
            );
            router = router.layer(RateLimitLayer::new(
                limiter.clone(),
                TrustedProxies::new(&config.trusted_proxies),
            ));
        }
        None => info!("Rate limiting disabled (RATE_LIMIT_MAX_REQUESTS=0)"),
    }

    router
}
