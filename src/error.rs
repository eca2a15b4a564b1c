//! Error types for Driftwood
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Covers both the federation-engine taxonomy (signature, policy,
/// collection and delivery errors) and infrastructure failures.
/// It implements `IntoResponse` to automatically convert errors
/// to appropriate HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// No Signature header on an inbound federation request (400)
    #[error("Missing Signature header")]
    SignatureMissing,

    /// Signature header present but unparseable (400)
    #[error("Malformed Signature header: {0}")]
    SignatureMalformed(String),

    /// Signature parsed but cryptographic verification failed (401)
    #[error("Invalid signature")]
    SignatureInvalid,

    /// Remote actor document could not be fetched or lacks a key (502)
    #[error("Remote actor unavailable: {0}")]
    RemoteActorUnavailable(String),

    /// Sender host is on the block list (403)
    #[error("Sender is blocked")]
    Blocked,

    /// Block target is already blocked (409)
    #[error("Already blocked")]
    AlreadyBlocked,

    /// Unblock target is not blocked (409)
    #[error("Not blocked")]
    NotBlocked,

    /// Pool target is already pooled (409)
    #[error("Already pooled")]
    AlreadyPooled,

    /// Unpool target is not pooled (409)
    #[error("Not pooled")]
    NotPooled,

    /// Policy operation with a scope it does not support (400)
    #[error("Invalid policy scope: {0}")]
    InvalidScope(String),

    /// Activity type outside the supported vocabulary (400)
    #[error("Unsupported activity type: {0}")]
    UnsupportedType(String),

    /// Duplicate vote/flag/follow (409)
    #[error("Duplicate action: {0}")]
    DuplicateAction(String),

    /// Undo with nothing to undo, or content from a non-follower (400)
    #[error("Not following")]
    NotFollowing,

    /// Malformed PEM or unusable key material (422)
    #[error("Key format error: {0}")]
    KeyFormat(String),

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
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
            AppError::SignatureMissing => (
                StatusCode::BAD_REQUEST,
                self.to_string(),
                "signature_missing",
            ),
            AppError::SignatureMalformed(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "signature_malformed")
            }
            AppError::SignatureInvalid => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "signature_invalid",
            ),
            AppError::RemoteActorUnavailable(msg) => {
                (StatusCode::BAD_GATEWAY, msg.clone(), "remote_actor")
            }
            AppError::Blocked => (StatusCode::FORBIDDEN, self.to_string(), "blocked"),
            AppError::AlreadyBlocked => (StatusCode::CONFLICT, self.to_string(), "already_blocked"),
            AppError::NotBlocked => (StatusCode::CONFLICT, self.to_string(), "not_blocked"),
            AppError::AlreadyPooled => (StatusCode::CONFLICT, self.to_string(), "already_pooled"),
            AppError::NotPooled => (StatusCode::CONFLICT, self.to_string(), "not_pooled"),
            AppError::InvalidScope(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "invalid_scope"),
            AppError::UnsupportedType(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "unsupported_type")
            }
            AppError::DuplicateAction(msg) => (StatusCode::CONFLICT, msg.clone(), "duplicate"),
            AppError::NotFollowing => (StatusCode::BAD_REQUEST, self.to_string(), "not_following"),
            AppError::KeyFormat(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone(), "key_format")
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
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

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL
            .with_label_values(&[error_type, "unknown"])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
