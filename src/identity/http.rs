//! Identity provider client speaking a userinfo-style HTTP endpoint.
//!
//! The token is forwarded as `Authorization: Bearer <token>` to the
//! configured URL. The provider answers:
//!
//! - `200` with `{"sub": "<id>"}` (or `{"user_id": "<id>"}`) for a valid token
//! - `401`/`403` for an invalid, expired or revoked token
//!
//! Anything else is treated as the provider being unavailable.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{IdentityVerifier, UserId, VerifyError};

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(alias = "user_id")]
    sub: String,
}

/// [`IdentityVerifier`] backed by a remote HTTP endpoint.
#[derive(Clone)]
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpIdentityVerifier {
    /// Create a verifier for `url` using a shared HTTP client.
    ///
    /// Deadlines are applied by the caller (see
    /// [`GuardedVerifier`](super::GuardedVerifier)), not by the client.
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, VerifyError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Identity provider request failed");
                VerifyError::Unavailable(e.to_string())
            })?;

        match response.status() {
            StatusCode::OK => {
                let info: UserInfo = response.json().await.map_err(|e| {
                    warn!(error = %e, "Identity provider returned an unreadable body");
                    VerifyError::Unavailable(format!("invalid userinfo body: {e}"))
                })?;

                if info.sub.is_empty() {
                    return Err(VerifyError::Unavailable(
                        "userinfo body carried an empty subject".to_string(),
                    ));
                }
                Ok(UserId::from(info.sub))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(status = %response.status(), "Identity provider rejected token");
                Err(VerifyError::Rejected)
            }
            status => {
                warn!(%status, "Unexpected identity provider status");
                Err(VerifyError::Unavailable(format!("unexpected status {status}")))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_userinfo_accepts_sub() {
        let info: UserInfo = serde_json::from_str(r#"{"sub":"u1","email":"a@b.c"}"#).unwrap();
        assert_eq!(info.sub, "u1");
    }

    #[test]
    fn test_userinfo_accepts_user_id_alias() {
        let info: UserInfo = serde_json::from_str(r#"{"user_id":"u2"}"#).unwrap();
        assert_eq!(info.sub, "u2");
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let verifier = HttpIdentityVerifier::new(reqwest::Client::new(), "http://127.0.0.1:9/");

        let err = verifier.verify("tok").await.unwrap_err();
        assert!(matches!(err, VerifyError::Unavailable(_)));
        assert!(err.is_provider_failure());
    }

    #[test]
    fn test_url_accessor() {
        let verifier = HttpIdentityVerifier::new(reqwest::Client::new(), "http://idp/userinfo");
        assert_eq!(verifier.url(), "http://idp/userinfo");
    }
}
