use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Message returned when no `Authorization` header is present.
pub const MSG_MISSING_AUTHORIZATION: &str = "Authorization header is required";

/// Message returned when the `Authorization` header is not a bearer credential.
pub const MSG_MALFORMED_AUTHORIZATION: &str = "Invalid authorization header format";

/// Message returned when the identity provider does not accept the token.
pub const MSG_INVALID_TOKEN: &str = "Invalid or expired token";

/// Message returned when a client exceeds its request quota.
pub const MSG_TOO_MANY_REQUESTS: &str = "Too many requests";

/// Message returned for every 5xx condition.
pub const MSG_INTERNAL: &str = "Internal server error";

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Client-facing rejections
///
/// `MissingAuthorization`, `MalformedAuthorization`, `InvalidToken` and
/// `RateLimited` terminate the current request. The middleware writes the
/// response itself and the handler never runs.
///
/// # Deployment defects
///
/// `PrincipalUnavailable` means a handler asked for the authenticated user on
/// a route that the auth layer does not cover. It is logged at `error` level
/// and surfaces as an opaque 500.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("authorization header missing")]
    MissingAuthorization,

    #[error("authorization header is not a bearer credential")]
    MalformedAuthorization,

    #[error("bearer token rejected")]
    InvalidToken,

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("authenticated principal missing from request context; is the auth layer installed?")]
    PrincipalUnavailable,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error envelope shared by every rejection this layer produces.
#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
}

impl AppError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingAuthorization
            | AppError::MalformedAuthorization
            | AppError::InvalidToken => StatusCode::UNAUTHORIZED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::PrincipalUnavailable | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable, client-visible message for this error.
    pub fn public_message(&self) -> &'static str {
        match self {
            AppError::MissingAuthorization => MSG_MISSING_AUTHORIZATION,
            AppError::MalformedAuthorization => MSG_MALFORMED_AUTHORIZATION,
            AppError::InvalidToken => MSG_INVALID_TOKEN,
            AppError::RateLimited { .. } => MSG_TOO_MANY_REQUESTS,
            AppError::PrincipalUnavailable | AppError::Config(_) | AppError::Internal(_) => {
                MSG_INTERNAL
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Client rejections are logged by the middleware that produced them,
        // with request context attached.
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let mut response = (
            status,
            axum::Json(ErrorResponse {
                error: self.public_message(),
            }),
        )
            .into_response();

        match self {
            AppError::MissingAuthorization
            | AppError::MalformedAuthorization
            | AppError::InvalidToken => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            AppError::RateLimited { retry_after_secs } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            }
            _ => {}
        }

        response
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
