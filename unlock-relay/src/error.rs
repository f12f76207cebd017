//! Error types for unlock-relay.
//!
//! Sending to a device that is not connected is not an error: the relay
//! drops the message and reports success.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Main error type for unlock-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// No valid session on the request.
    #[error("authentication required")]
    Unauthenticated,

    /// Missing or malformed argument (e.g. empty deviceId).
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the request.
        reason: String,
    },

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Shorthand for [`RelayError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<unlock_types::TypesError> for RelayError {
    fn from(err: unlock_types::TypesError) -> Self {
        Self::invalid(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Config(_) | Self::Io(_) => {
                tracing::error!("Internal error: {}", self);
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
