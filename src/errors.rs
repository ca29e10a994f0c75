//! Application error model with HTTP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to an HTTP status plus a structured JSON payload.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the relay may encounter. Each variant maps to an
/// HTTP status and a short machine-readable code in [`ErrorBody`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Caller did not present a bearer credential
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    /// Caller presented the wrong bearer credential
    #[error("not authorized: {0}")]
    Forbidden(String),
    /// Resource not found (folder, message)
    #[error("not found: {0}")]
    NotFound(String),
    /// An attachment, or the sum of all attachments, exceeds the size cap
    #[error("attachment too large: {0}")]
    AttachmentTooLarge(String),
    /// Mail server rejected the configured credentials
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Remote collaborator failed (SMTP rejection, attachment host error)
    #[error("upstream failure: {0}")]
    Upstream(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response, download)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error payload returned to HTTP callers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// HTTP status code of the error
    pub status: u16,
    /// Application-specific error identifier
    pub code: &'static str,
    /// Human-readable summary of the error
    pub message: String,
    /// Additional information that may help resolve the error
    pub details: Option<String>,
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// HTTP status for this error
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → 400
    /// - `Unauthenticated` → 401
    /// - `Forbidden` → 403
    /// - `NotFound` → 404
    /// - `AttachmentTooLarge` → 413
    /// - `AuthFailed`, `Upstream` → 502
    /// - `Timeout` → 504
    /// - `Internal` → 500
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AttachmentTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::AuthFailed(_) | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_request",
            Self::Unauthenticated(_) => "not_authenticated",
            Self::Forbidden(_) => "not_authorized",
            Self::NotFound(_) => "not_found",
            Self::AttachmentTooLarge(_) => "payload_too_large",
            Self::AuthFailed(_) => "auth_failed",
            Self::Upstream(_) => "upstream_error",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "server_error",
        }
    }

    /// Whether the caller caused this error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Build the JSON payload for this error
    ///
    /// Internal errors are reported generically; their detail is only logged.
    pub fn to_body(&self) -> ErrorBody {
        if let Self::Internal(_) = self {
            return ErrorBody {
                status: self.status().as_u16(),
                code: self.code(),
                message: "internal server error".to_owned(),
                details: None,
            };
        }
        let details = match self {
            Self::InvalidInput(d)
            | Self::Unauthenticated(d)
            | Self::Forbidden(d)
            | Self::NotFound(d)
            | Self::AttachmentTooLarge(d)
            | Self::AuthFailed(d)
            | Self::Upstream(d)
            | Self::Timeout(d)
            | Self::Internal(d) => d.clone(),
        };
        ErrorBody {
            status: self.status().as_u16(),
            code: self.code(),
            message: self.to_string(),
            details: Some(details),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.is_client_error() {
            tracing::debug!(code = self.code(), error = %self, "request rejected");
        } else {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        (self.status(), Json(self.to_body())).into_response()
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
