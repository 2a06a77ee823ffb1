//! HTTP middleware for authentication and rate limiting.
//!
//! - **Rate Limiting**: fixed-window request counting per client key
//! - **Bearer Authentication**: identity provider verification with a TTL cache
//! - **Client Identification**: proxy header resolution with an optional
//!   trusted proxy allowlist
//!
//! # Architecture
//!
//! ```text
//! Request → Rate Limiter → Auth → Handler → Response
//!              ↓             ↓
//!          429 + Retry-After  401 + WWW-Authenticate
//! ```
//!
//! Rate limiting runs first so that rejected clients never cost an identity
//! provider round trip.

pub mod auth;
pub mod ip;
pub mod rate_limit;

pub use auth::{AuthLayer, AuthService, BEARER_PREFIX, CurrentUser, UserIdExt, get_user_id};
pub use ip::{TrustedProxies, UNKNOWN_CLIENT, X_FORWARDED_FOR, X_REAL_IP, resolve_client_key};
pub use rate_limit::{RateLimitLayer, RateLimitService};
