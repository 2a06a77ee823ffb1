//! # Gateway Guard
//!
//! Bearer token authentication and per-client rate limiting for Axum
//! services, featuring:
//!
//! - **Verification cache**: tokens verified by the identity provider are
//!   trusted for a fixed TTL, so repeat requests skip the provider
//! - **Resilience**: provider calls carry a deadline and sit behind a circuit breaker
//! - **Rate limiting**: fixed-window counters keyed by client address
//! - **Observability**: structured logging and Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RateLimitLayer → AuthLayer → Trace → Body limit            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (CurrentUser extractor)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RateLimiter        TokenVerificationCache                  │
//! │                     GuardedVerifier → HttpIdentityVerifier  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gateway_guard::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::from_config(config)?;
//!     let app = build_router(state.clone());
//!
//!     // Serve with `into_make_service_with_connect_info::<SocketAddr>()`,
//!     // then `state.shutdown().await`.
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! IDENTITY_VERIFY_URL=https://idp.example.com/userinfo \
//! RATE_LIMIT_MAX_REQUESTS=100 RATE_LIMIT_WINDOW_SECS=60 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limiter;
pub mod routes;
pub mod state;
mod sweeper;
pub mod token_cache;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use identity::{IdentityVerifier, UserId, VerifyError};
pub use middleware::{CurrentUser, UserIdExt, get_user_id};
pub use rate_limiter::RateLimiter;
pub use routes::{apply_guards, build_router};
pub use state::AppState;
pub use token_cache::TokenVerificationCache;
