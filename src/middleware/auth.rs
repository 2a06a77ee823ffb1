//! Bearer token authentication middleware.
//!
//! # Flow
//!
//! ```text
//! Authorization header?
//!   ├─ absent ───────────────────────────► 401 "Authorization header is required"
//!   ├─ not "Bearer <token>" ─────────────► 401 "Invalid authorization header format"
//!   └─ token
//!        ├─ cache hit ───────────────────► attach UserId, continue
//!        └─ cache miss → IdentityVerifier
//!             ├─ Ok(user) → cache.set ───► attach UserId, continue
//!             └─ Err(_) (never cached) ──► 401 "Invalid or expired token"
//! ```
//!
//! The verifier call lives inside the request future, so a client that
//! disconnects (or a server-side timeout that drops the future) abandons the
//! provider call as well.
//!
//! # Reading the principal
//!
//! Handlers behind this layer use the [`CurrentUser`] extractor or
//! [`get_user_id`]. Both fail with [`AppError::PrincipalUnavailable`] (500)
//! if the layer does not cover the route, which is a wiring bug rather than
//! a client error.
//!
//! # Bypassed Endpoints
//!
//! Exact-match paths from `AUTH_BYPASS_PATHS` (default `/health`) skip
//! authentication. `/health/` and `/HEALTH` are not bypassed.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap, Request, Response, header};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use crate::error::{AppError, AppResult};
use crate::identity::{IdentityVerifier, UserId, VerifyError};
use crate::metrics::{self, outcome};
use crate::token_cache::TokenVerificationCache;

/// Literal prefix of a bearer credential, scheme and separator included.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Default paths that bypass authentication.
const DEFAULT_BYPASS_PATHS: [&str; 1] = ["/health"];

/// Bearer token authentication layer.
#[derive(Clone)]
pub struct AuthLayer {
    verifier: Arc<dyn IdentityVerifier>,
    cache: Arc<TokenVerificationCache>,
    bypass_paths: Arc<Vec<String>>,
}

impl AuthLayer {
    /// Create an auth layer with the default bypass paths.
    pub fn new(verifier: Arc<dyn IdentityVerifier>, cache: Arc<TokenVerificationCache>) -> Self {
        Self {
            verifier,
            cache,
            bypass_paths: Arc::new(
                DEFAULT_BYPASS_PATHS
                    .iter()
                    .map(|s| (*s).to_string())
                    .collect(),
            ),
        }
    }

    /// Replace the set of paths served without authentication.
    #[must_use]
    pub fn with_bypass_paths(mut self, bypass_paths: Vec<String>) -> Self {
        self.bypass_paths = Arc::new(bypass_paths);
        self
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            verifier: self.verifier.clone(),
            cache: self.cache.clone(),
            bypass_paths: self.bypass_paths.clone(),
        }
    }
}

/// Bearer token authentication service wrapper.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    verifier: Arc<dyn IdentityVerifier>,
    cache: Arc<TokenVerificationCache>,
    bypass_paths: Arc<Vec<String>>,
}

impl<S> Service<Request<Body>> for AuthService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let verifier = self.verifier.clone();
        let cache = self.cache.clone();
        let bypass_paths = self.bypass_paths.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let path = req.uri().path();
            if bypass_paths.iter().any(|p| p == path) {
                debug!(path, "Bypassing auth for public endpoint");
                return inner.call(req).await;
            }

            match authenticate(req.headers(), &cache, verifier.as_ref()).await {
                Ok(user_id) => {
                    req.extensions_mut().insert(user_id);
                    inner.call(req).await
                }
                Err(rejection) => {
                    warn!(
                        path = %req.uri().path(),
                        reason = %rejection,
                        "Request rejected by authentication"
                    );
                    Ok(rejection.into_response())
                }
            }
        })
    }
}

/// Extract the bearer token from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> AppResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AppError::MissingAuthorization)?;

    value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .ok_or(AppError::MalformedAuthorization)
}

/// Resolve the principal for a request, consulting the cache before the verifier.
async fn authenticate(
    headers: &HeaderMap,
    cache: &TokenVerificationCache,
    verifier: &dyn IdentityVerifier,
) -> AppResult<UserId> {
    let token = match bearer_token(headers) {
        Ok(token) => token,
        Err(e) => {
            metrics::record_auth_outcome(match e {
                AppError::MissingAuthorization => outcome::MISSING,
                _ => outcome::MALFORMED,
            });
            return Err(e);
        }
    };

    if token.is_empty() {
        metrics::record_auth_outcome(outcome::REJECTED);
        return Err(AppError::InvalidToken);
    }

    if let Some(user_id) = cache.get(token) {
        metrics::record_cache_lookup(true);
        metrics::record_auth_outcome(outcome::CACHED);
        debug!(user_id = %user_id, "Token cache hit");
        return Ok(user_id);
    }
    metrics::record_cache_lookup(false);

    match verifier.verify(token).await {
        Ok(user_id) => {
            cache.set(token, user_id.clone());
            metrics::record_auth_outcome(outcome::VERIFIED);
            debug!(user_id = %user_id, "Token verified by identity provider");
            Ok(user_id)
        }
        Err(e) => {
            match &e {
                VerifyError::Rejected => debug!("Identity provider rejected token"),
                VerifyError::CircuitOpen => {
                    warn!("Identity provider circuit open, failing verification fast")
                }
                VerifyError::Unavailable(_) | VerifyError::Timeout => {
                    error!(error = %e, "Identity provider failure during verification")
                }
            }
            metrics::record_auth_outcome(outcome::REJECTED);
            Err(AppError::InvalidToken)
        }
    }
}

/// Read the authenticated principal from request extensions.
///
/// # Errors
///
/// [`AppError::PrincipalUnavailable`] if [`AuthLayer`] did not run for this
/// request.
pub fn get_user_id(extensions: &Extensions) -> AppResult<UserId> {
    extensions
        .get::<UserId>()
        .cloned()
        .ok_or(AppError::PrincipalUnavailable)
}

/// Extension trait to read the authenticated principal from a request.
pub trait UserIdExt {
    fn user_id(&self) -> AppResult<UserId>;
}

impl<B> UserIdExt for Request<B> {
    fn user_id(&self) -> AppResult<UserId> {
        get_user_id(self.extensions())
    }
}

/// Extractor yielding the authenticated principal.
///
/// ```rust,ignore
/// async fn me(CurrentUser(user_id): CurrentUser) -> String {
///     user_id.into_inner()
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserId);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        get_user_id(&parts.extensions).map(CurrentUser).inspect_err(|_| {
            error!(
                path = %parts.uri.path(),
                "Handler requires an authenticated user but the auth layer did not run; check middleware ordering"
            );
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        outcome: Result<UserId, VerifyError>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(outcome: Result<UserId, VerifyError>) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IdentityVerifier for Fixed {
        async fn verify(&self, _token: &str) -> Result<UserId, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn headers(authorization: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(bearer_token(&headers(Some("Bearer abc"))).unwrap(), "abc");
        assert!(matches!(
            bearer_token(&headers(None)),
            Err(AppError::MissingAuthorization)
        ));
        assert!(matches!(
            bearer_token(&headers(Some("BadScheme xyz"))),
            Err(AppError::MalformedAuthorization)
        ));
        // Scheme match is on the literal prefix
        assert!(matches!(
            bearer_token(&headers(Some("bearer abc"))),
            Err(AppError::MalformedAuthorization)
        ));
        assert!(matches!(
            bearer_token(&headers(Some("Bearer"))),
            Err(AppError::MalformedAuthorization)
        ));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_verifier() {
        let cache = TokenVerificationCache::default();
        cache.set("tok", UserId::new("cached-user"));
        let verifier = Fixed::new(Ok(UserId::new("fresh-user")));

        let user = authenticate(&headers(Some("Bearer tok")), &cache, &verifier)
            .await
            .unwrap();

        assert_eq!(user, UserId::new("cached-user"));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_miss_verifies_and_stores() {
        let cache = TokenVerificationCache::default();
        let verifier = Fixed::new(Ok(UserId::new("u1")));

        let user = authenticate(&headers(Some("Bearer tok")), &cache, &verifier)
            .await
            .unwrap();

        assert_eq!(user, UserId::new("u1"));
        assert_eq!(cache.get("tok"), Some(UserId::new("u1")));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = TokenVerificationCache::default();
        let verifier = Fixed::new(Err(VerifyError::Unavailable("down".into())));

        for _ in 0..2 {
            let err = authenticate(&headers(Some("Bearer tok")), &cache, &verifier)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::InvalidToken));
        }

        assert!(cache.is_empty());
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_token_rejected_without_provider_call() {
        let cache = TokenVerificationCache::default();
        let verifier = Fixed::new(Ok(UserId::new("u1")));

        let err = authenticate(&headers(Some("Bearer ")), &cache, &verifier)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidToken));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_get_user_id_present() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        req.extensions_mut().insert(UserId::new("u1"));

        assert_eq!(req.user_id().unwrap(), UserId::new("u1"));
    }

    #[test]
    fn test_get_user_id_missing_is_configuration_error() {
        let req = Request::builder().body(Body::empty()).unwrap();

        assert!(matches!(
            get_user_id(req.extensions()),
            Err(AppError::PrincipalUnavailable)
        ));
    }
}
