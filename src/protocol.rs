//! WebSocket Protocol Envelope
//!
//! This module defines the wire-level message envelope exchanged over a
//! canvas channel, plus the recognized message kinds and constructors for
//! server-originated envelopes.
//!
//! The envelope is deliberately flat and stringly-kinded: unknown kinds from
//! either side are ignored rather than rejected, so clients and servers can
//! add message kinds without breaking each other.

use serde::{Deserialize, Serialize};

/// Recognized message kinds
pub mod kind {
    /// Client: associate this channel with a canvas and user
    pub const JOIN: &str = "join";
    /// Client: leave the current canvas
    pub const LEAVE: &str = "leave";
    /// Client: opaque canvas state delta, relayed to other participants
    pub const CANVAS_UPDATE: &str = "canvas-update";
    /// Client: opaque cursor movement, relayed to other participants
    pub const CURSOR_POSITION: &str = "cursor-position";
    /// Client: application-level liveness refresh
    pub const HEARTBEAT: &str = "heartbeat";

    /// Server: sent once when the socket is accepted
    pub const CONNECTION_ESTABLISHED: &str = "server-connection-established";
    /// Server: join accepted and registered
    pub const CONNECTION_ACKNOWLEDGED: &str = "connection-acknowledged";
    /// Server: the other active user ids on the joined canvas
    pub const ACTIVE_USERS: &str = "active-users";
    /// Server: another user joined the canvas
    pub const USER_JOINED: &str = "user-joined";
    /// Server: a user left the canvas (or was evicted)
    pub const USER_LEFT: &str = "user-left";
    /// Server: reply to a client heartbeat
    pub const HEARTBEAT_ACK: &str = "heartbeat-ack";
    /// Server: a request was rejected
    pub const ERROR: &str = "error";
}

/// The wire-level unit exchanged over a canvas channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific payload; opaque for relayed kinds
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Canvas the message concerns
    pub canvas_id: i64,
    /// User the message originates from or concerns
    pub user_id: i64,
    /// Display name of that user
    pub username: String,
}

impl Envelope {
    /// Parse an inbound text frame and check the minimal envelope shape
    pub fn parse(text: &str) -> crate::error::Result<Self> {
        let envelope: Self = serde_json::from_str(text)
            .map_err(|e| crate::error::Error::invalid_envelope(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check the minimal shape: a kind, positive canvas/user ids, a username
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.kind.is_empty() {
            return Err(crate::error::Error::invalid_envelope("empty message type"));
        }
        if self.canvas_id <= 0 {
            return Err(crate::error::Error::invalid_envelope(format!(
                "invalid canvasId: {}",
                self.canvas_id
            )));
        }
        if self.user_id <= 0 {
            return Err(crate::error::Error::invalid_envelope(format!(
                "invalid userId: {}",
                self.user_id
            )));
        }
        if self.username.is_empty() {
            return Err(crate::error::Error::invalid_envelope("empty username"));
        }
        Ok(())
    }

    /// Serialize to the wire form
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn server(kind: &str, payload: serde_json::Value, canvas_id: i64, user_id: i64) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            canvas_id,
            user_id,
            username: "server".to_string(),
        }
    }

    /// Sent once when a socket is accepted, before any join
    #[must_use]
    pub fn connection_established() -> Self {
        // The channel is not yet associated with a canvas or user, so the
        // envelope carries placeholder ids.
        Self {
            kind: kind::CONNECTION_ESTABLISHED.to_string(),
            payload: serde_json::json!({ "message": "connected" }),
            canvas_id: 0,
            user_id: 0,
            username: "server".to_string(),
        }
    }

    /// Acknowledge a successful join
    #[must_use]
    pub fn connection_acknowledged(canvas_id: i64, user_id: i64) -> Self {
        Self::server(
            kind::CONNECTION_ACKNOWLEDGED,
            serde_json::Value::Null,
            canvas_id,
            user_id,
        )
    }

    /// Report the other active users on a canvas to a joining user
    #[must_use]
    pub fn active_users(canvas_id: i64, user_id: i64, users: &[i64]) -> Self {
        Self::server(
            kind::ACTIVE_USERS,
            serde_json::json!({ "users": users }),
            canvas_id,
            user_id,
        )
    }

    /// Announce that a user joined a canvas
    #[must_use]
    pub fn user_joined(canvas_id: i64, user_id: i64, username: &str) -> Self {
        Self {
            kind: kind::USER_JOINED.to_string(),
            payload: serde_json::json!({ "username": username }),
            canvas_id,
            user_id,
            username: username.to_string(),
        }
    }

    /// Announce that a user left a canvas
    #[must_use]
    pub fn user_left(canvas_id: i64, user_id: i64, username: &str) -> Self {
        Self {
            kind: kind::USER_LEFT.to_string(),
            payload: serde_json::json!({ "username": username }),
            canvas_id,
            user_id,
            username: username.to_string(),
        }
    }

    /// Reply to a client heartbeat
    #[must_use]
    pub fn heartbeat_ack(canvas_id: i64, user_id: i64) -> Self {
        Self::server(kind::HEARTBEAT_ACK, serde_json::Value::Null, canvas_id, user_id)
    }

    /// Reject a request; the connection stays open
    #[must_use]
    pub fn error(canvas_id: i64, user_id: i64, code: &str, message: impl Into<String>) -> Self {
        Self::server(
            kind::ERROR,
            serde_json::json!({ "code": code, "message": message.into() }),
            canvas_id,
            user_id,
        )
    }
}
