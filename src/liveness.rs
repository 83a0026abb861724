//! Liveness Monitor
//!
//! Periodically probes every registered channel and evicts the unresponsive
//! ones. Each cycle, a channel that produced no liveness evidence since the
//! previous probe is forcibly closed, unregistered, and announced to the rest
//! of its canvas as `user-left`; otherwise its flag is cleared and a ping
//! frame is sent. Any inbound application message or pong sets the flag
//! again, so registry staleness is bounded by two probe intervals.
//!
//! The monitor task is owned by the transport state and torn down through a
//! cancellation token so the periodic task is not leaked on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fanout::BroadcastFanout;
use crate::protocol::Envelope;
use crate::registry::{ConnectionRegistry, Registration};

/// Default probe interval
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(20);

/// Periodic prober over the shared connection registry
pub struct LivenessMonitor {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl LivenessMonitor {
    /// Spawn the monitor over a registry, probing on a fixed interval
    #[must_use]
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        fanout: BroadcastFanout,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a channel that
            // registered just before the monitor started is not probed early.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => sweep(&registry, &fanout).await,
                }
            }
            debug!("liveness monitor stopped");
        });
        Self { task, cancel }
    }

    /// Stop the periodic task
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// One probe cycle over every registered channel
async fn sweep(registry: &Arc<ConnectionRegistry>, fanout: &BroadcastFanout) {
    let snapshot = registry.snapshot_all().await;
    let mut evicted: Vec<(i64, Registration)> = Vec::new();

    for (canvas_id, registration) in snapshot {
        if !registration.handle.take_alive() {
            // No evidence of life since the previous probe.
            warn!(
                canvas_id,
                user_id = registration.user_id,
                "channel missed liveness probe, evicting"
            );
            registration.handle.close("liveness probe timeout");
            evicted.push((canvas_id, registration));
        } else if registration.handle.send_probe().is_err() {
            // A channel that cannot even accept a probe is already dead;
            // evict now rather than waiting a full cycle.
            warn!(
                canvas_id,
                user_id = registration.user_id,
                "probe send failed, evicting immediately"
            );
            evicted.push((canvas_id, registration));
        }
    }

    for (canvas_id, registration) in evicted {
        registry
            .unregister_channel(canvas_id, registration.user_id, registration.handle.id())
            .await;
        let envelope =
            Envelope::user_left(canvas_id, registration.user_id, &registration.username);
        if let Err(e) = fanout.broadcast(canvas_id, &envelope, None).await {
            warn!(canvas_id, error = %e, "failed to announce evicted user");
        } else {
            info!(
                canvas_id,
                user_id = registration.user_id,
                "evicted unresponsive channel"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChannelHandle;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    async fn register(
        registry: &ConnectionRegistry,
        canvas_id: i64,
        user_id: i64,
    ) -> (ChannelHandle, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle::new(tx);
        registry
            .register(canvas_id, user_id, "u", handle.clone())
            .await;
        (handle, rx)
    }

    async fn settle() {
        // Let the monitor task observe the advanced clock.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_channel_receives_probe_and_survives() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = BroadcastFanout::new(registry.clone());
        let (handle, mut rx) = register(&registry, 5, 7).await;
        let _monitor =
            LivenessMonitor::spawn(registry.clone(), fanout, Duration::from_secs(20));
        settle().await;

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(20)).await;
            settle().await;
            // Respond to each probe the way the socket loop does on pong.
            handle.mark_alive();
        }

        let mut pings = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, Message::Ping(_)) {
                pings += 1;
            }
        }
        assert!(pings >= 3, "expected at least 3 probes, saw {pings}");
        assert_eq!(registry.snapshot(5).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_channel_evicted_within_two_intervals() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = BroadcastFanout::new(registry.clone());

        // User 7 goes silent; user 8 keeps responding and should observe the
        // eviction as a user-left broadcast.
        let (_silent, mut silent_rx) = register(&registry, 5, 7).await;
        let (witness, mut witness_rx) = register(&registry, 5, 8).await;

        let _monitor =
            LivenessMonitor::spawn(registry.clone(), fanout, Duration::from_secs(20));
        settle().await;

        // First cycle: both flags cleared, probes sent; keep the witness alive.
        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        witness.mark_alive();
        assert_eq!(registry.snapshot(5).await.len(), 2);

        // Second cycle: the silent channel has no evidence and is evicted.
        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;

        let snapshot = registry.snapshot(5).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].user_id, 8);

        // The evicted channel got a close frame.
        let mut closed = false;
        while let Ok(msg) = silent_rx.try_recv() {
            if matches!(msg, Message::Close(_)) {
                closed = true;
            }
        }
        assert!(closed, "evicted channel should receive a close frame");

        // The witness saw the user-left announcement for user 7.
        let mut saw_user_left = false;
        while let Ok(msg) = witness_rx.try_recv() {
            if let Message::Text(text) = msg {
                if text.contains("user-left") && text.contains("\"userId\":7") {
                    saw_user_left = true;
                }
            }
        }
        assert!(saw_user_left, "witness should observe user-left for user 7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_with_dead_outbox_evicted_immediately() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = BroadcastFanout::new(registry.clone());
        let (handle, rx) = register(&registry, 5, 7).await;
        drop(rx);
        handle.mark_alive();

        let _monitor =
            LivenessMonitor::spawn(registry.clone(), fanout, Duration::from_secs(20));
        settle().await;

        // One cycle is enough: the probe send fails so the channel does not
        // get a grace interval.
        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;

        assert!(registry.snapshot(5).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_probing() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = BroadcastFanout::new(registry.clone());
        let (_handle, mut rx) = register(&registry, 5, 7).await;

        let monitor = LivenessMonitor::spawn(registry.clone(), fanout, Duration::from_secs(20));
        monitor.shutdown();
        settle().await;

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert!(rx.try_recv().is_err(), "no probes after shutdown");
        // Eviction stopped too: the silent channel is still registered.
        assert_eq!(registry.snapshot(5).await.len(), 1);
    }
}
