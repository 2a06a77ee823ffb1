//! Identity verification seam.
//!
//! The gateway never decides on its own whether a bearer token is valid; it
//! asks an [`IdentityVerifier`]. Production wiring stacks two implementations:
//!
//! ```text
//! AuthService ──► GuardedVerifier (circuit breaker + deadline) ──► HttpIdentityVerifier
//! ```
//!
//! Tests substitute their own verifier through the same trait.

mod circuit_breaker;
mod http;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, GuardedVerifier};
pub use http::HttpIdentityVerifier;

/// Verified principal identifier attached to an authenticated request.
///
/// Stored in request extensions by the auth layer and read back through
/// [`crate::middleware::get_user_id`] or the
/// [`CurrentUser`](crate::middleware::CurrentUser) extractor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Why a token could not be verified.
///
/// Every variant is reported to the client as the same 401. The split
/// exists for logging and for the circuit breaker, which only counts
/// provider-side failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The provider answered and refused the token (invalid, expired, revoked).
    #[error("token rejected by identity provider")]
    Rejected,

    /// The provider could not be reached or answered unexpectedly.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    /// The provider did not answer within the configured deadline.
    #[error("identity provider timed out")]
    Timeout,

    /// Calls are being short-circuited after repeated provider failures.
    #[error("identity provider circuit is open")]
    CircuitOpen,
}

impl VerifyError {
    /// Whether this failure says something about provider health rather than the token.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, VerifyError::Unavailable(_) | VerifyError::Timeout)
    }
}

/// Validates a bearer token against an identity provider.
///
/// Implementations may perform network I/O. Callers bound each call with a
/// deadline, and dropping the returned future must abandon the call.
#[async_trait]
pub trait IdentityVerifier: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Result<UserId, VerifyError>;
}

#[async_trait]
impl<V> IdentityVerifier for std::sync::Arc<V>
where
    V: IdentityVerifier + ?Sized,
{
    async fn verify(&self, token: &str) -> Result<UserId, VerifyError> {
        (**self).verify(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display_and_access() {
        let id = UserId::new("u1");
        assert_eq!(id.as_str(), "u1");
        assert_eq!(id.to_string(), "u1");
        assert_eq!(UserId::from("u1"), id);
        assert_eq!(id.into_inner(), "u1");
    }

    #[test]
    fn test_provider_failure_classification() {
        assert!(VerifyError::Unavailable("boom".into()).is_provider_failure());
        assert!(VerifyError::Timeout.is_provider_failure());
        assert!(!VerifyError::Rejected.is_provider_failure());
        assert!(!VerifyError::CircuitOpen.is_provider_failure());
    }
}
