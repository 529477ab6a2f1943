//! Error types for the stream layer and configuration loading.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_core::ClientId;
use serde::Serialize;
use thiserror::Error;

/// Failure reported by an [`EventHandler`](crate::stream::handler::EventHandler) hook.
///
/// The message is surfaced verbatim in the `{"error": ...}` body returned
/// to the client whose connection was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error with a client-visible message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The client-visible message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Errors raised while accepting, driving, or addressing stream sessions.
#[derive(Debug, Error)]
pub enum StreamError {
    /// `on_initialize` refused the connection.
    #[error("initialization failed: {0}")]
    InitializationFailed(#[source] HandlerError),
    /// `on_connect` refused the connection.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] HandlerError),
    /// The response body is gone; the client disconnected.
    #[error("write to client failed")]
    WriteFailed,
    /// The session's direct queue has no free slot.
    #[error("direct message buffer full")]
    QueueFull,
    /// The session was already closed.
    #[error("session closed")]
    SessionClosed,
    /// A callback request carried no client id.
    #[error("missing client id")]
    MissingClientId,
    /// A callback request named a client that is not connected.
    #[error("client not found: {0}")]
    ClientNotFound(ClientId),
    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    /// The inbound request could not be read.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StreamError {
    /// HTTP status used when this error is returned to a client.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ClientNotFound(_) => StatusCode::NOT_FOUND,
            Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// JSON body written for every error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Human-readable error message.
    pub error: String,
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Errors that can occur while loading server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A config value was invalid (e.g., a zero capacity).
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
