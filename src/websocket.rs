//! WebSocket Handler
//!
//! This module wires the session state machine to real sockets: the axum
//! upgrade handler, the shared collaboration state, and the per-connection
//! read/write plumbing.
//!
//! Each connection gets one writer task draining an unbounded outbox into
//! the socket sink, so registry and fanout callers queue frames without ever
//! blocking on a slow peer, and one read loop driving the session state
//! machine. Closing the socket cancels only that connection's tasks and
//! synchronously runs registry cleanup before the read task terminates.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CollabConfig;
use crate::fanout::BroadcastFanout;
use crate::liveness::LivenessMonitor;
use crate::protocol::Envelope;
use crate::registry::{ChannelHandle, ConnectionRegistry};
use crate::session::ClientSession;

/// Shared state for the collaboration fabric
///
/// Constructed with the transport server and torn down with it; owns the
/// registry, the fanout, and the liveness monitor task.
pub struct CollabState {
    /// Live connection registry
    pub registry: Arc<ConnectionRegistry>,
    /// Fanout over the registry
    pub fanout: BroadcastFanout,
    monitor: LivenessMonitor,
}

impl CollabState {
    /// Create the shared state and start the liveness monitor
    #[must_use]
    pub fn new(config: &CollabConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = BroadcastFanout::new(registry.clone());
        let monitor = LivenessMonitor::spawn(
            registry.clone(),
            fanout.clone(),
            Duration::from_secs(config.probe_interval_secs),
        );
        Self {
            registry,
            fanout,
            monitor,
        }
    }

    /// Stop the liveness monitor; called when the transport server shuts down
    pub fn shutdown(&self) {
        self.monitor.shutdown();
    }
}

/// WebSocket upgrade handler
pub async fn collab_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<CollabState>>,
) -> impl IntoResponse {
    info!("WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one accepted socket until it closes
pub async fn handle_socket(socket: WebSocket, state: Arc<CollabState>) {
    let (mut sink, mut stream) = socket.split();

    // Writer task: drain the connection's outbox into the socket. Everything
    // queued through the ChannelHandle goes out here.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    let handle = ChannelHandle::new(tx);
    let channel_id = handle.id();
    info!(channel_id = %channel_id, "WebSocket connected");

    if handle
        .send_envelope(&Envelope::connection_established())
        .is_err()
    {
        warn!(channel_id = %channel_id, "failed to send connection greeting");
        writer.abort();
        return;
    }

    let mut session = ClientSession::new(
        handle.clone(),
        state.registry.clone(),
        state.fanout.clone(),
    );

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                debug!(channel_id = %channel_id, "received frame");
                session.handle_text(&text).await;
            }
            Ok(Message::Pong(_)) => session.on_pong(),
            Ok(Message::Ping(data)) => {
                session.on_pong();
                let _ = handle.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                debug!(channel_id = %channel_id, "socket closed by client");
                break;
            }
            Ok(Message::Binary(_)) => {
                // The protocol is text-only; binary frames are ignored.
            }
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "socket error");
                break;
            }
        }
    }

    // Cleanup runs before the task terminates so the rest of the canvas
    // learns about the departure immediately.
    session.on_close().await;
    writer.abort();
    info!(channel_id = %channel_id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collab_state_lifecycle() {
        let state = CollabState::new(&CollabConfig::default());
        assert_eq!(state.registry.connection_count().await, 0);
        state.shutdown();
    }
}
