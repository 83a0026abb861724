//! Error types for collab-canvas
//!
//! This module provides error types for the collaborative canvas core,
//! covering the WebSocket fabric, identifier reconciliation, and storage.
//!
//! Nothing here is fatal to the process: every failure degrades to "this one
//! connection/edge/save is lost", and carries enough context to attribute it
//! to a canvas and, where applicable, a user.

use thiserror::Error;

/// Collaborative canvas error type
#[derive(Debug, Error)]
pub enum Error {
    /// Canvas not found
    #[error("canvas not found: {0}")]
    CanvasNotFound(i64),

    /// Inbound envelope failed the minimal shape check
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The peer's channel is closed; sends to it can never succeed
    #[error("channel closed")]
    ChannelClosed,

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Full-state replacement failed even after the timestamp-only fallback
    #[error("state replacement failed for canvas {canvas_id}: {reason}")]
    ReplaceFailed {
        /// Canvas the replacement targeted
        canvas_id: i64,
        /// Underlying cause
        reason: String,
    },
}

impl Error {
    /// Create a WebSocket error
    #[must_use]
    pub fn websocket(msg: impl Into<String>) -> Self {
        Self::WebSocket(msg.into())
    }

    /// Create a database error
    #[must_use]
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create an invalid envelope error
    #[must_use]
    pub fn invalid_envelope(msg: impl Into<String>) -> Self {
        Self::InvalidEnvelope(msg.into())
    }

    /// Get error code for protocol `error` envelopes
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CanvasNotFound(_) => "canvas_not_found",
            Self::InvalidEnvelope(_) => "invalid_envelope",
            Self::ChannelClosed => "channel_closed",
            Self::WebSocket(_) => "websocket_error",
            Self::Database(_) => "database_error",
            Self::Serialization(_) => "serialization_error",
            Self::ReplaceFailed { .. } => "replace_failed",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type alias for canvas operations
pub type Result<T> = std::result::Result<T, Error>;
