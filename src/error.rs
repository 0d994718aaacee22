//! Error types for Meridian
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for HTTP error responses and
//! classifies itself as transient or permanent for the job queues.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Variants group into the federation error classes:
/// authentication (`Unauthorized`, `InvalidSignature`), not found,
/// validation, transient infrastructure (`Database`, `HttpClient`,
/// `Federation`, `RateLimited`) and permanent protocol errors
/// (`Protocol`, `Forbidden`).
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Signature verification failed (401)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Non-retryable protocol error, e.g. a malformed entity (422)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote federation failure that may succeed later (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit exceeded (429)
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether retrying the failed operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::HttpClient(_)
                | AppError::Federation(_)
                | AppError::RateLimited
        )
    }

    /// Whether the error is an authentication failure.
    pub fn is_authentication(&self) -> bool {
        matches!(self, AppError::Unauthorized | AppError::InvalidSignature(_))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            AppError::InvalidSignature(_) => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "invalid_signature",
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string(), "forbidden"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::Protocol(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone(), "protocol")
            }
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                self.to_string(),
                "rate_limited",
            ),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "federation"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "http_client"),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_covers_infrastructure_errors() {
        assert!(AppError::Federation("timeout".to_string()).is_transient());
        assert!(AppError::RateLimited.is_transient());
        assert!(AppError::Database(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn protocol_and_auth_errors_are_not_transient() {
        assert!(!AppError::Protocol("bad entity".to_string()).is_transient());
        assert!(!AppError::InvalidSignature("stale".to_string()).is_transient());
        assert!(!AppError::Validation("missing".to_string()).is_transient());
        assert!(AppError::InvalidSignature("stale".to_string()).is_authentication());
    }

    #[test]
    fn invalid_signature_maps_to_unauthorized() {
        let response = AppError::InvalidSignature("digest mismatch".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
