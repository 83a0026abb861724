//! Connection Registry
//!
//! This module tracks, per canvas, the set of live channels keyed by user
//! identity. Registration, eviction, and snapshot-for-broadcast all happen
//! concurrently from independent channel tasks and the liveness timer, so the
//! membership map lives behind a lock and snapshots are point-in-time copies.
//!
//! At most one live registration exists per (canvas, user) pair: a newer
//! channel always evicts an older one, and the older channel is told why via
//! a normal-closure close frame.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// Handle to one client channel's outbox
///
/// Sends are non-blocking: frames are queued on an unbounded channel drained
/// by that connection's writer task, so a slow consumer never stalls the
/// caller. A failed send means the writer task is gone and the channel is
/// dead.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
    alive: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// Create a handle over a connection's outbox sender
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Unique identity of this channel, stable across clones
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a raw frame for delivery
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::ChannelClosed)
    }

    /// Queue a pre-serialized text frame for delivery
    pub fn send_text(&self, text: String) -> Result<()> {
        self.send(Message::Text(text))
    }

    /// Serialize and queue an envelope
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send_text(envelope.to_json()?)
    }

    /// Queue a liveness probe frame
    pub fn send_probe(&self) -> Result<()> {
        self.send(Message::Ping(Vec::new()))
    }

    /// Queue a close frame; best-effort, the channel may already be gone
    pub fn close(&self, reason: &'static str) {
        let _ = self.send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed(reason),
        })));
    }

    /// Record liveness evidence (any inbound message or probe response)
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Consume the liveness flag: returns whether evidence arrived since the
    /// last probe, and clears the flag for the next probe cycle
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

/// A live registration on a canvas
#[derive(Debug, Clone)]
pub struct Registration {
    /// Registered user
    pub user_id: i64,
    /// Display name supplied at join time
    pub username: String,
    /// The user's channel
    pub handle: ChannelHandle,
    /// When the registration was created
    pub registered_at: DateTime<Utc>,
}

/// Per-canvas map of live channels keyed by user identity
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    canvases: RwLock<HashMap<i64, HashMap<i64, Registration>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a channel for (canvas, user), evicting any prior channel for
    /// the same pair
    ///
    /// The evicted channel receives a normal-closure frame so the old client
    /// is told explicitly why it was disconnected. Returns the evicted
    /// registration, if any.
    pub async fn register(
        &self,
        canvas_id: i64,
        user_id: i64,
        username: &str,
        handle: ChannelHandle,
    ) -> Option<Registration> {
        let channel_id = handle.id();
        let replaced = {
            let mut canvases = self.canvases.write().await;
            canvases.entry(canvas_id).or_default().insert(
                user_id,
                Registration {
                    user_id,
                    username: username.to_string(),
                    handle,
                    registered_at: Utc::now(),
                },
            )
        };

        if let Some(ref old) = replaced {
            // A re-affirming register of the same channel must not close it.
            if old.handle.id() != channel_id {
                debug!(
                    canvas_id,
                    user_id, "replacing existing registration with newer channel"
                );
                old.handle.close("replaced by a newer connection");
            }
        }
        replaced
    }

    /// Remove the registration for (canvas, user); idempotent
    pub async fn unregister(&self, canvas_id: i64, user_id: i64) -> Option<Registration> {
        let mut canvases = self.canvases.write().await;
        let members = canvases.get_mut(&canvas_id)?;
        let removed = members.remove(&user_id);
        if members.is_empty() {
            canvases.remove(&canvas_id);
        }
        removed
    }

    /// Remove the registration for (canvas, user) only if it still belongs to
    /// the given channel
    ///
    /// A channel that was replaced by a newer one must not tear down its
    /// successor's registration on close; matching on channel identity makes
    /// the close path safe to run in any order relative to replacement.
    pub async fn unregister_channel(
        &self,
        canvas_id: i64,
        user_id: i64,
        channel_id: Uuid,
    ) -> Option<Registration> {
        let mut canvases = self.canvases.write().await;
        let members = canvases.get_mut(&canvas_id)?;
        if members.get(&user_id).map(|r| r.handle.id()) != Some(channel_id) {
            return None;
        }
        let removed = members.remove(&user_id);
        if members.is_empty() {
            canvases.remove(&canvas_id);
        }
        removed
    }

    /// Find an orphaned registration by channel identity
    ///
    /// Linear scan over all canvases; only used by the session close fallback
    /// when the handler no longer knows which (canvas, user) owned a channel.
    pub async fn find_by_channel(&self, channel_id: Uuid) -> Option<(i64, Registration)> {
        let canvases = self.canvases.read().await;
        for (canvas_id, members) in canvases.iter() {
            for registration in members.values() {
                if registration.handle.id() == channel_id {
                    return Some((*canvas_id, registration.clone()));
                }
            }
        }
        None
    }

    /// Point-in-time copy of the registrations on a canvas
    pub async fn snapshot(&self, canvas_id: i64) -> Vec<Registration> {
        let canvases = self.canvases.read().await;
        canvases
            .get(&canvas_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Point-in-time copy of every registration across all canvases
    pub async fn snapshot_all(&self) -> Vec<(i64, Registration)> {
        let canvases = self.canvases.read().await;
        canvases
            .iter()
            .flat_map(|(canvas_id, members)| {
                members.values().map(|r| (*canvas_id, r.clone()))
            })
            .collect()
    }

    /// User ids currently registered on a canvas, excluding one
    pub async fn active_users(&self, canvas_id: i64, exclude_user_id: i64) -> Vec<i64> {
        let canvases = self.canvases.read().await;
        let mut users: Vec<i64> = canvases
            .get(&canvas_id)
            .map(|members| {
                members
                    .keys()
                    .copied()
                    .filter(|&id| id != exclude_user_id)
                    .collect()
            })
            .unwrap_or_default();
        users.sort_unstable();
        users
    }

    /// Total number of registrations across all canvases
    pub async fn connection_count(&self) -> usize {
        let canvases = self.canvases.read().await;
        canvases.values().map(HashMap::len).sum()
    }
}
