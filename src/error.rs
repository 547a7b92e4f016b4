//! # Error Handling
//!
//! This module defines the error types used across the relay and how the
//! hosting layer turns them into HTTP responses.
//!
//! ## Error Families:
//! - **ProviderError**: Everything that can go wrong between an adapter and
//!   its upstream STT provider
//! - **SessionError**: Failures of the client-facing side of a session
//! - **AppError**: HTTP-level errors returned before a WebSocket upgrade
//!
//! ## Propagation Policy:
//! - `ProviderError::Config` / `ProviderError::Connect` abort session start and
//!   are reported to the client exactly once
//! - `ProviderError::Decode` never leaves the adapter; the frame is dropped
//! - An upstream close is a normal end of the reader task, not an error
//! - A failed send to the client (`SessionError::ClientGone`) ends the session

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors raised by a provider adapter.
///
/// ## Variants:
/// - **Config**: Missing/blank API key or malformed endpoint URL; no connection was attempted
/// - **Connect**: WebSocket handshake failed or timed out
/// - **NotConnected**: `feed`/`finish` called before `start` or after `finish`
/// - **UpstreamClosed**: A send failed because the provider connection is gone
/// - **Decode**: An inbound provider frame could not be interpreted
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    Config(String),
    Connect(String),
    NotConnected,
    UpstreamClosed(String),
    Decode(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ProviderError::Connect(msg) => write!(f, "Connection error: {}", msg),
            ProviderError::NotConnected => write!(f, "Provider stream is not connected"),
            ProviderError::UpstreamClosed(msg) => write!(f, "Upstream closed: {}", msg),
            ProviderError::Decode(msg) => write!(f, "Decode error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Errors on the client-facing side of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The outbound channel to the client connection is closed; the
    /// connection is presumed dead.
    ClientGone,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ClientGone => write!(f, "Client connection is gone"),
        }
    }
}

impl std::error::Error for SessionError {}

/// HTTP errors returned by the hosting layer.
///
/// ## Error Categories:
/// - **BadRequest**: The WebSocket upgrade request was invalid (400)
/// - **NotFound**: The route names an unknown provider (404)
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

/// Converts hosting-layer errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "unknown provider 'whisper'",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }

    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            AppError::BadRequest(_) => actix_web::http::StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => actix_web::http::StatusCode::NOT_FOUND,
        }
    }
}

impl From<actix_web::Error> for AppError {
    fn from(err: actix_web::Error) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// Type alias for hosting-layer handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::Config("DEEPGRAM_API_KEY is not set".to_string());
        assert!(err.to_string().contains("DEEPGRAM_API_KEY"));

        let err = ProviderError::Connect("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        assert_eq!(
            ProviderError::NotConnected.to_string(),
            "Provider stream is not connected"
        );
    }

    #[test]
    fn test_app_error_status() {
        let err = AppError::NotFound("unknown provider 'x'".to_string());
        assert_eq!(err.status_code(), actix_web::http::StatusCode::NOT_FOUND);

        let response = err.error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
