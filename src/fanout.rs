//! Broadcast Fanout
//!
//! Delivers one envelope to every registered channel on a canvas, optionally
//! excluding the sender. The envelope is serialized once, iteration runs over
//! a point-in-time registry snapshot, and channels found dead during delivery
//! are unregistered after the iteration so the registry is never mutated
//! while being walked.
//!
//! Delivery is fire-and-forget per recipient: frames are queued on each
//! connection's outbox and the call does not wait for slow or backpressured
//! sockets.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::Envelope;
use crate::registry::{ConnectionRegistry, Registration};

/// Fanout over the shared connection registry
#[derive(Clone)]
pub struct BroadcastFanout {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastFanout {
    /// Create a fanout bound to a registry
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this fanout delivers through
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deliver an envelope to every registered channel on a canvas
    ///
    /// Returns the number of channels the envelope was queued for. Channels
    /// whose outbox is gone are treated as dead and evicted after delivery.
    pub async fn broadcast(
        &self,
        canvas_id: i64,
        envelope: &Envelope,
        exclude_user_id: Option<i64>,
    ) -> Result<usize> {
        // Serialize once, not once per recipient.
        let frame = envelope.to_json()?;

        let snapshot = self.registry.snapshot(canvas_id).await;
        let delivered = self
            .deliver(canvas_id, &frame, &snapshot, exclude_user_id)
            .await;

        debug!(
            canvas_id,
            kind = %envelope.kind,
            delivered,
            "broadcast complete"
        );
        Ok(delivered)
    }

    async fn deliver(
        &self,
        canvas_id: i64,
        frame: &str,
        snapshot: &[Registration],
        exclude_user_id: Option<i64>,
    ) -> usize {
        let mut delivered = 0usize;
        let mut dead: Vec<&Registration> = Vec::new();

        for registration in snapshot {
            if Some(registration.user_id) == exclude_user_id {
                continue;
            }
            if registration.handle.send_text(frame.to_string()).is_err() {
                dead.push(registration);
            } else {
                delivered += 1;
            }
        }

        // Evict by channel identity so a reconnection that slipped in behind
        // the snapshot is never torn down by mistake.
        for registration in dead {
            warn!(
                canvas_id,
                user_id = registration.user_id,
                "evicting dead channel found during broadcast"
            );
            self.registry
                .unregister_channel(canvas_id, registration.user_id, registration.handle.id())
                .await;
        }

        delivered
    }
}
