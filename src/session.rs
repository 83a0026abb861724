//! Session Handler
//!
//! Per-connection protocol state machine. A channel starts CONNECTED (open
//! but not yet associated with a canvas or user), transitions to JOINED on a
//! valid `join` envelope, and ends CLOSED when the socket goes away.
//! Transitions are driven entirely by inbound envelopes; side effects are
//! strictly scoped to the connection registry and the broadcast fanout, and
//! no persistence happens on this path.
//!
//! Close handling has a fallback: if the handler never learned which
//! (canvas, user) owned the channel (registration state only arrives in
//! messages, never with the initial connection), it linearly scans the
//! registry by channel identity to find and remove the orphaned entry.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::fanout::BroadcastFanout;
use crate::protocol::{kind, Envelope};
use crate::registry::{ChannelHandle, ConnectionRegistry};

/// Lifecycle state of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Channel open, not yet associated with a canvas/user
    Connected,
    /// Associated and registered in the connection registry
    Joined {
        /// Canvas the channel is registered on
        canvas_id: i64,
        /// User the channel belongs to
        user_id: i64,
        /// Display name supplied at join time
        username: String,
    },
    /// Terminal; the socket is gone and cleanup has run
    Closed,
}

/// State machine for one client channel
pub struct ClientSession {
    state: SessionState,
    handle: ChannelHandle,
    registry: Arc<ConnectionRegistry>,
    fanout: BroadcastFanout,
}

impl ClientSession {
    /// Create a session for a freshly accepted channel
    #[must_use]
    pub fn new(
        handle: ChannelHandle,
        registry: Arc<ConnectionRegistry>,
        fanout: BroadcastFanout,
    ) -> Self {
        Self {
            state: SessionState::Connected,
            handle,
            registry,
            fanout,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Process one inbound text frame
    ///
    /// Malformed envelopes are answered with an `error` envelope and cause no
    /// state change; unknown kinds are logged and ignored.
    pub async fn handle_text(&mut self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "rejecting malformed envelope");
                let reply = Envelope::error(0, 0, e.code(), e.to_string());
                let _ = self.handle.send_envelope(&reply);
                return;
            }
        };

        // Any well-formed inbound message is liveness evidence.
        self.handle.mark_alive();

        match envelope.kind.as_str() {
            kind::JOIN => self.on_join(&envelope).await,
            kind::LEAVE => self.on_leave(&envelope).await,
            kind::CANVAS_UPDATE | kind::CURSOR_POSITION => self.relay(&envelope).await,
            kind::HEARTBEAT => self.on_heartbeat(&envelope),
            other => {
                // Forward-compatible: unknown kinds are not an error.
                debug!(kind = other, canvas_id = envelope.canvas_id, "ignoring unknown message kind");
            }
        }
    }

    /// Record a liveness probe response
    pub fn on_pong(&self) {
        self.handle.mark_alive();
    }

    async fn on_join(&mut self, envelope: &Envelope) {
        let canvas_id = envelope.canvas_id;
        let user_id = envelope.user_id;

        // Re-joining under a different identity abandons the old
        // registration first, so the channel never holds two entries.
        if let SessionState::Joined {
            canvas_id: old_canvas,
            user_id: old_user,
            ref username,
        } = self.state
        {
            if (old_canvas, old_user) != (canvas_id, user_id) {
                let username = username.clone();
                self.registry
                    .unregister_channel(old_canvas, old_user, self.handle.id())
                    .await;
                let left = Envelope::user_left(old_canvas, old_user, &username);
                let _ = self.fanout.broadcast(old_canvas, &left, None).await;
            }
        }

        self.registry
            .register(canvas_id, user_id, &envelope.username, self.handle.clone())
            .await;
        self.state = SessionState::Joined {
            canvas_id,
            user_id,
            username: envelope.username.clone(),
        };
        info!(canvas_id, user_id, "user joined canvas");

        let _ = self
            .handle
            .send_envelope(&Envelope::connection_acknowledged(canvas_id, user_id));

        // Tell the joiner who else is here, and the rest about the joiner.
        let others = self.registry.active_users(canvas_id, user_id).await;
        let _ = self
            .handle
            .send_envelope(&Envelope::active_users(canvas_id, user_id, &others));

        let joined = Envelope::user_joined(canvas_id, user_id, &envelope.username);
        let _ = self
            .fanout
            .broadcast(canvas_id, &joined, Some(user_id))
            .await;
    }

    async fn on_leave(&mut self, envelope: &Envelope) {
        let canvas_id = envelope.canvas_id;
        let user_id = envelope.user_id;
        info!(canvas_id, user_id, "user left canvas");

        let left = Envelope::user_left(canvas_id, user_id, &envelope.username);
        let _ = self.fanout.broadcast(canvas_id, &left, Some(user_id)).await;
        self.registry
            .unregister_channel(canvas_id, user_id, self.handle.id())
            .await;
        self.state = SessionState::Connected;
    }

    /// Relay an opaque envelope to the rest of the canvas, excluding the
    /// sender; the server does not interpret the payload
    async fn relay(&self, envelope: &Envelope) {
        if let Err(e) = self
            .fanout
            .broadcast(envelope.canvas_id, envelope, Some(envelope.user_id))
            .await
        {
            warn!(
                canvas_id = envelope.canvas_id,
                user_id = envelope.user_id,
                error = %e,
                "relay broadcast failed"
            );
        }
    }

    fn on_heartbeat(&self, envelope: &Envelope) {
        // Liveness was already refreshed above; heartbeats are acknowledged
        // to the sender and never rebroadcast.
        let ack = Envelope::heartbeat_ack(envelope.canvas_id, envelope.user_id);
        let _ = self.handle.send_envelope(&ack);
    }

    /// Run registry cleanup and the `user-left` announcement for a channel
    /// that closed for any reason
    pub async fn on_close(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Joined {
                canvas_id,
                user_id,
                username,
            } => {
                let removed = self
                    .registry
                    .unregister_channel(canvas_id, user_id, self.handle.id())
                    .await;
                // If a newer channel already replaced this one, the newer
                // registration stays and no departure is announced.
                if removed.is_some() {
                    let left = Envelope::user_left(canvas_id, user_id, &username);
                    let _ = self.fanout.broadcast(canvas_id, &left, None).await;
                    info!(canvas_id, user_id, "channel closed, registration removed");
                }
            }
            SessionState::Connected => {
                // The session never saw a join, but the channel may still be
                // registered (e.g. state lost across handler restarts); fall
                // back to a linear scan by channel identity.
                if let Some((canvas_id, registration)) =
                    self.registry.find_by_channel(self.handle.id()).await
                {
                    self.registry
                        .unregister_channel(canvas_id, registration.user_id, self.handle.id())
                        .await;
                    let left = Envelope::user_left(
                        canvas_id,
                        registration.user_id,
                        &registration.username,
                    );
                    let _ = self.fanout.broadcast(canvas_id, &left, None).await;
                    info!(
                        canvas_id,
                        user_id = registration.user_id,
                        "orphaned registration removed on close"
                    );
                }
            }
            SessionState::Closed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        fanout: BroadcastFanout,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let fanout = BroadcastFanout::new(registry.clone());
            Self { registry, fanout }
        }

        fn session(&self) -> (ClientSession, UnboundedReceiver<Message>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = ChannelHandle::new(tx);
            (
                ClientSession::new(handle, self.registry.clone(), self.fanout.clone()),
                rx,
            )
        }
    }

    fn join_text(canvas_id: i64, user_id: i64, username: &str) -> String {
        format!(
            r#"{{"type":"join","payload":{{}},"canvasId":{canvas_id},"userId":{user_id},"username":"{username}"}}"#
        )
    }

    fn drain_texts(rx: &mut UnboundedReceiver<Message>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(text);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_join_registers_and_replies() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.session();

        session.handle_text(&join_text(1, 7, "ada")).await;

        assert!(matches!(
            session.state(),
            SessionState::Joined { canvas_id: 1, user_id: 7, .. }
        ));
        assert_eq!(fx.registry.snapshot(1).await.len(), 1);

        let replies = drain_texts(&mut rx);
        assert!(replies.iter().any(|t| t.contains("connection-acknowledged")));
        assert!(replies.iter().any(|t| t.contains("active-users")));
    }

    #[tokio::test]
    async fn test_rejoin_same_pair_keeps_channel_open() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.session();

        session.handle_text(&join_text(1, 7, "ada")).await;
        drain_texts(&mut rx);
        session.handle_text(&join_text(1, 7, "ada")).await;

        // A repeated join for the same pair re-affirms the registration
        // without disconnecting the session's own channel.
        let mut saw_close = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, Message::Close(_)) {
                saw_close = true;
            }
        }
        assert!(!saw_close);
        assert!(matches!(
            session.state(),
            SessionState::Joined { canvas_id: 1, user_id: 7, .. }
        ));
        assert_eq!(fx.registry.snapshot(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_join_announces_to_other_users() {
        let fx = Fixture::new();
        let (mut first, mut first_rx) = fx.session();
        first.handle_text(&join_text(1, 7, "ada")).await;
        drain_texts(&mut first_rx);

        let (mut second, mut second_rx) = fx.session();
        second.handle_text(&join_text(1, 8, "bob")).await;

        // The existing user sees user-joined; the joiner does not.
        let first_msgs = drain_texts(&mut first_rx);
        assert!(first_msgs.iter().any(|t| t.contains("user-joined")));
        let second_msgs = drain_texts(&mut second_rx);
        assert!(!second_msgs.iter().any(|t| t.contains("user-joined")));

        // And the joiner's active-users list names the first user.
        assert!(second_msgs.iter().any(|t| t.contains("active-users") && t.contains("7")));
    }

    #[tokio::test]
    async fn test_malformed_envelope_rejected_without_state_change() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.session();

        session.handle_text("{\"type\":\"join\"}").await;
        session.handle_text("not json at all").await;

        assert_eq!(*session.state(), SessionState::Connected);
        assert_eq!(fx.registry.connection_count().await, 0);

        let replies = drain_texts(&mut rx);
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|t| t.contains("\"type\":\"error\"")));
    }

    #[tokio::test]
    async fn test_unknown_kind_ignored_silently() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.session();
        session.handle_text(&join_text(1, 7, "ada")).await;
        drain_texts(&mut rx);

        session
            .handle_text(
                r#"{"type":"emoji-reaction","payload":{},"canvasId":1,"userId":7,"username":"ada"}"#,
            )
            .await;

        // No error surfaced and no state change.
        assert!(drain_texts(&mut rx).is_empty());
        assert!(matches!(session.state(), SessionState::Joined { .. }));
    }

    #[tokio::test]
    async fn test_canvas_update_relayed_excluding_sender() {
        let fx = Fixture::new();
        let (mut sender, mut sender_rx) = fx.session();
        let (mut receiver, mut receiver_rx) = fx.session();
        sender.handle_text(&join_text(1, 7, "ada")).await;
        receiver.handle_text(&join_text(1, 8, "bob")).await;
        drain_texts(&mut sender_rx);
        drain_texts(&mut receiver_rx);

        sender
            .handle_text(
                r#"{"type":"canvas-update","payload":{"nodes":[]},"canvasId":1,"userId":7,"username":"ada"}"#,
            )
            .await;

        let received = drain_texts(&mut receiver_rx);
        assert!(received.iter().any(|t| t.contains("canvas-update")));
        assert!(drain_texts(&mut sender_rx).is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_acknowledged_not_rebroadcast() {
        let fx = Fixture::new();
        let (mut sender, mut sender_rx) = fx.session();
        let (mut other, mut other_rx) = fx.session();
        sender.handle_text(&join_text(1, 7, "ada")).await;
        other.handle_text(&join_text(1, 8, "bob")).await;
        drain_texts(&mut sender_rx);
        drain_texts(&mut other_rx);

        sender
            .handle_text(
                r#"{"type":"heartbeat","payload":{},"canvasId":1,"userId":7,"username":"ada"}"#,
            )
            .await;

        let replies = drain_texts(&mut sender_rx);
        assert!(replies.iter().any(|t| t.contains("heartbeat-ack")));
        assert!(drain_texts(&mut other_rx).is_empty());
    }

    #[tokio::test]
    async fn test_leave_unregisters_and_announces() {
        let fx = Fixture::new();
        let (mut leaver, mut leaver_rx) = fx.session();
        let (mut stayer, mut stayer_rx) = fx.session();
        leaver.handle_text(&join_text(1, 7, "ada")).await;
        stayer.handle_text(&join_text(1, 8, "bob")).await;
        drain_texts(&mut leaver_rx);
        drain_texts(&mut stayer_rx);

        leaver
            .handle_text(
                r#"{"type":"leave","payload":{},"canvasId":1,"userId":7,"username":"ada"}"#,
            )
            .await;

        assert_eq!(*leaver.state(), SessionState::Connected);
        assert_eq!(fx.registry.snapshot(1).await.len(), 1);
        assert!(drain_texts(&mut stayer_rx)
            .iter()
            .any(|t| t.contains("user-left")));
    }

    #[tokio::test]
    async fn test_close_announces_departure() {
        let fx = Fixture::new();
        let (mut closer, _closer_rx) = fx.session();
        let (mut witness, mut witness_rx) = fx.session();
        closer.handle_text(&join_text(1, 7, "ada")).await;
        witness.handle_text(&join_text(1, 8, "bob")).await;
        drain_texts(&mut witness_rx);

        closer.on_close().await;

        assert_eq!(*closer.state(), SessionState::Closed);
        assert_eq!(fx.registry.snapshot(1).await.len(), 1);
        assert!(drain_texts(&mut witness_rx)
            .iter()
            .any(|t| t.contains("user-left") && t.contains("\"userId\":7")));
    }

    #[tokio::test]
    async fn test_close_fallback_scans_for_orphaned_registration() {
        let fx = Fixture::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle::new(tx);

        // The registration exists but this session never observed a join.
        fx.registry.register(1, 7, "ada", handle.clone()).await;
        let mut session = ClientSession::new(handle, fx.registry.clone(), fx.fanout.clone());

        let (mut witness, mut witness_rx) = fx.session();
        witness.handle_text(&join_text(1, 8, "bob")).await;
        drain_texts(&mut witness_rx);

        session.on_close().await;

        assert!(fx
            .registry
            .snapshot(1)
            .await
            .iter()
            .all(|r| r.user_id != 7));
        assert!(drain_texts(&mut witness_rx)
            .iter()
            .any(|t| t.contains("user-left")));
    }

    #[tokio::test]
    async fn test_replaced_channel_close_keeps_successor() {
        let fx = Fixture::new();
        let (mut old, _old_rx) = fx.session();
        old.handle_text(&join_text(1, 7, "ada")).await;

        let (mut new, _new_rx) = fx.session();
        new.handle_text(&join_text(1, 7, "ada")).await;

        let (mut witness, mut witness_rx) = fx.session();
        witness.handle_text(&join_text(1, 8, "bob")).await;
        drain_texts(&mut witness_rx);

        // The evicted channel's close path runs after its replacement.
        old.on_close().await;

        // The newer registration survives and no spurious departure is seen.
        assert!(fx
            .registry
            .snapshot(1)
            .await
            .iter()
            .any(|r| r.user_id == 7));
        assert!(!drain_texts(&mut witness_rx)
            .iter()
            .any(|t| t.contains("user-left")));
    }
}
