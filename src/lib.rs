//! Collab Canvas - Real-Time Collaborative Canvas Core
//!
//! This crate provides the core of a multi-user collaborative canvas:
//! - Model: canvas, node, and edge entity types
//! - Protocol: the wire envelope exchanged over canvas channels
//! - Registry: per-canvas tracking of live channels keyed by user
//! - Fanout: one-to-many delivery over a registry snapshot
//! - Liveness: periodic probing and eviction of unresponsive channels
//! - Session: the per-connection protocol state machine
//! - WebSocket: axum upgrade handler and per-socket plumbing
//! - Reconcile: ephemeral-to-durable identifier reconciliation
//! - Store: persistence boundary trait and SQLite implementation
//! - Replace: full-state replacement and snapshot loading
//!
//! ## Features
//!
//! - Live multiplexed broadcast over many concurrent channels, one
//!   lightweight task per connection
//! - Replace-on-duplicate registration: a newer channel for the same
//!   (canvas, user) evicts the older one with an explicit close
//! - Liveness probing with staleness bounded by two probe intervals
//! - Save/load cycles that never lose or duplicate a node or edge, even
//!   though the client and the store name them in different id spaces
//!
//! ## Usage
//!
//! ```ignore
//! use collab_canvas::{collab_ws_handler, CollabConfig, CollabState};
//! use axum::{routing::get, Router};
//! use std::sync::Arc;
//!
//! let state = Arc::new(CollabState::new(&CollabConfig::default()));
//! let app: Router<()> = Router::new()
//!     .route("/ws/canvas", get(collab_ws_handler))
//!     .with_state(state);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod fanout;
pub mod liveness;
pub mod model;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod replace;
pub mod session;
pub mod store;
pub mod websocket;

// Re-export main types
pub use config::CollabConfig;
pub use error::{Error, Result};
pub use fanout::BroadcastFanout;
pub use liveness::{LivenessMonitor, DEFAULT_PROBE_INTERVAL};
pub use model::{
    Canvas, IncomingEdge, IncomingNode, NodeKind, PersistedEdge, PersistedNode, Position,
    Visibility,
};
pub use protocol::{kind, Envelope};
pub use reconcile::{IdMap, EDGE_SOURCE_KEYS, EDGE_TARGET_KEYS, NODE_CLIENT_ID_KEYS};
pub use registry::{ChannelHandle, ConnectionRegistry, Registration};
pub use replace::{CanvasSnapshot, ReplaceReport, ReplaceStatus, StateReplacer};
pub use session::{ClientSession, SessionState};
pub use store::{CanvasStore, SqliteCanvasStore};
pub use websocket::{collab_ws_handler, CollabState};
