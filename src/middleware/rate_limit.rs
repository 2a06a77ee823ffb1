//! Per-client rate limiting middleware.
//!
//! Resolves the client key (see [`super::ip`]), counts the request against
//! the shared [`RateLimiter`] and either forwards the request untouched or
//! answers immediately with:
//!
//! ```text
//! HTTP/1.1 429 Too Many Requests
//! Retry-After: <seconds until the client's window resets>
//! Content-Type: application/json
//!
//! {"error":"Too many requests"}
//! ```
//!
//! A rejected request never reaches the inner service.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use super::ip::{TrustedProxies, resolve_client_key};
use crate::error::AppError;
use crate::metrics;
use crate::rate_limiter::{RateDecision, RateLimiter};

/// Whole seconds a client should wait, rounded up and never zero.
fn retry_after_secs(retry_after: Duration, window: Duration) -> u64 {
    let wait = if retry_after.is_zero() {
        window
    } else {
        retry_after
    };
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

/// Rate limiting layer for the Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = Arc::new(RateLimiter::new(NonZeroU32::new(100).unwrap(), Duration::from_secs(60)));
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(RateLimitLayer::new(limiter, TrustedProxies::default()));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    trusted_proxies: Arc<TrustedProxies>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>, trusted_proxies: TrustedProxies) -> Self {
        Self {
            limiter,
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    trusted_proxies: Arc<TrustedProxies>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let client_key = resolve_client_key(&req, &self.trusted_proxies);

        match self.limiter.check(&client_key) {
            RateDecision::Allowed => {
                // Take the service that was driven to readiness, leave a fresh clone behind
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move { inner.call(req).await })
            }
            RateDecision::Limited { retry_after } => {
                let retry_after_secs = retry_after_secs(retry_after, self.limiter.window());

                warn!(
                    client_key = %client_key,
                    path = %req.uri().path(),
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                metrics::record_rate_limited();

                let response = AppError::RateLimited { retry_after_secs }.into_response();
                Box::pin(async move { Ok(response) })
            }
        }
    }
}
