//! State Replacer
//!
//! Orchestrates full-state replacement of a canvas: delete every persisted
//! node and edge, insert the incoming elements through the identifier
//! reconciler, then bump the canvas timestamp. The operation is destructive-
//! then-constructive and not transactional end to end; a failure mid-way
//! falls back to a timestamp-only update and is reported as a distinguishable
//! partial result rather than masked as success.
//!
//! The companion [`StateReplacer::load`] reads persisted state back into the
//! client shape, re-deriving ephemeral identifiers from the stamped payloads.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{IncomingEdge, IncomingNode, NodeKind, Position};
use crate::reconcile::{
    harvest_aliases, recover_edge_endpoint, recover_node_client_id, resolve_source,
    resolve_target, stamp_edge, stamp_node, IdMap,
};
use crate::store::CanvasStore;

/// Outcome status of a replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStatus {
    /// The full pipeline ran to completion
    Complete,
    /// Persistence failed mid-way; only the timestamp fallback succeeded
    Partial,
}

/// Report of one replacement run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceReport {
    /// Whether the run completed or degraded to the fallback
    pub status: ReplaceStatus,
    /// Nodes persisted
    pub nodes_written: usize,
    /// Malformed nodes skipped (missing content or kind)
    pub nodes_skipped: usize,
    /// Edges persisted
    pub edges_written: usize,
    /// Edges dropped because an endpoint never resolved
    pub edges_dropped: usize,
    /// Cause of a partial result
    pub error: Option<String>,
}

/// A node in the client-facing canvas snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotNode {
    /// Ephemeral id recovered from the stamped payloads
    pub id: String,
    /// Durable store id
    pub durable_id: i64,
    /// Node kind
    pub kind: NodeKind,
    /// Content payload
    pub content: Value,
    /// Position on the canvas
    pub position: Position,
    /// Optional width
    pub width: Option<f64>,
    /// Optional height
    pub height: Option<f64>,
    /// Style payload
    pub style: Option<Value>,
}

/// An edge in the client-facing canvas snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEdge {
    /// Durable store id
    pub durable_id: i64,
    /// Ephemeral id of the source node
    pub source: String,
    /// Ephemeral id of the target node
    pub target: String,
    /// Rendering type hint
    #[serde(rename = "type")]
    pub edge_type: Option<String>,
    /// Whether the edge is rendered animated
    pub animated: bool,
    /// Style payload
    pub style: Option<Value>,
}

/// Client-facing view of a canvas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    /// All nodes on the canvas
    pub nodes: Vec<SnapshotNode>,
    /// All edges on the canvas
    pub edges: Vec<SnapshotEdge>,
}

/// Full-state replacement over the persistence boundary
pub struct StateReplacer {
    store: Arc<dyn CanvasStore>,
}

impl StateReplacer {
    /// Create a replacer over a store
    #[must_use]
    pub fn new(store: Arc<dyn CanvasStore>) -> Self {
        Self { store }
    }

    /// Replace the whole persisted state of a canvas
    ///
    /// Malformed nodes are skipped and unresolvable edges dropped, counted in
    /// the report. On mid-way persistence failure the timestamp-only fallback
    /// runs and the report comes back [`ReplaceStatus::Partial`]; an `Err` is
    /// returned only when even the fallback failed.
    pub async fn replace(
        &self,
        canvas_id: i64,
        nodes: Vec<IncomingNode>,
        edges: Vec<IncomingEdge>,
    ) -> Result<ReplaceReport> {
        match self.replace_inner(canvas_id, nodes, edges).await {
            Ok(report) => {
                info!(
                    canvas_id,
                    nodes = report.nodes_written,
                    edges = report.edges_written,
                    skipped = report.nodes_skipped,
                    dropped = report.edges_dropped,
                    "canvas state replaced"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(canvas_id, error = %e, "state replacement failed, attempting timestamp fallback");
                match self.store.touch_canvas(canvas_id).await {
                    Ok(_) => Ok(ReplaceReport {
                        status: ReplaceStatus::Partial,
                        nodes_written: 0,
                        nodes_skipped: 0,
                        edges_written: 0,
                        edges_dropped: 0,
                        error: Some(e.to_string()),
                    }),
                    Err(fallback) => {
                        warn!(canvas_id, error = %fallback, "timestamp fallback failed too");
                        Err(Error::ReplaceFailed {
                            canvas_id,
                            reason: e.to_string(),
                        })
                    }
                }
            }
        }
    }

    async fn replace_inner(
        &self,
        canvas_id: i64,
        nodes: Vec<IncomingNode>,
        edges: Vec<IncomingEdge>,
    ) -> Result<ReplaceReport> {
        // Destructive phase: edges first, they reference nodes.
        self.store.delete_all_edges(canvas_id).await?;
        self.store.delete_all_nodes(canvas_id).await?;

        // Constructive phase: insert nodes one at a time, building the
        // ephemeral-to-durable mapping as each durable id becomes available.
        let mut map = IdMap::new();
        let mut nodes_written = 0usize;
        let mut nodes_skipped = 0usize;

        for mut node in nodes {
            let Some(kind) = node.kind.as_deref().and_then(NodeKind::parse) else {
                debug!(canvas_id, node_id = %node.id, "skipping node without a recognizable kind");
                nodes_skipped += 1;
                continue;
            };
            if node.content.is_none() {
                debug!(canvas_id, node_id = %node.id, "skipping node without content");
                nodes_skipped += 1;
                continue;
            }

            // Harvest alternates the client already embedded, then stamp the
            // canonical id everywhere before persisting.
            harvest_aliases(&mut map, &node);
            stamp_node(&mut node);

            let durable = self
                .store
                .insert_node(
                    canvas_id,
                    kind,
                    node.content.as_ref().unwrap_or(&Value::Null),
                    node.position,
                    node.width,
                    node.height,
                    node.style.as_ref(),
                )
                .await?;
            map.record(&node.id, durable);
            nodes_written += 1;
        }

        let mut edges_written = 0usize;
        let mut edges_dropped = 0usize;

        for mut edge in edges {
            let (Some(source_durable), Some(target_durable)) =
                (resolve_source(&edge, &map), resolve_target(&edge, &map))
            else {
                // Drop, don't fail: an edge with a dangling endpoint must
                // never be persisted, and one bad edge does not abort the
                // batch.
                debug!(
                    canvas_id,
                    source = edge.source.as_deref().unwrap_or("?"),
                    target = edge.target.as_deref().unwrap_or("?"),
                    "dropping edge with unresolved endpoint"
                );
                edges_dropped += 1;
                continue;
            };

            // Stamp the canonical ephemeral ids, not whatever alias the edge
            // happened to resolve through, so the next load is consistent
            // with the node stamps.
            let source_ephemeral = map
                .ephemeral_for(source_durable)
                .map(str::to_string)
                .unwrap_or_else(|| format!("node-{source_durable}"));
            let target_ephemeral = map
                .ephemeral_for(target_durable)
                .map(str::to_string)
                .unwrap_or_else(|| format!("node-{target_durable}"));
            stamp_edge(
                &mut edge,
                &source_ephemeral,
                &target_ephemeral,
                source_durable,
                target_durable,
            );

            self.store
                .insert_edge(
                    canvas_id,
                    source_durable,
                    target_durable,
                    edge.edge_type.as_deref(),
                    edge.animated,
                    edge.style.as_ref(),
                )
                .await?;
            edges_written += 1;
        }

        self.store.touch_canvas(canvas_id).await?;

        Ok(ReplaceReport {
            status: ReplaceStatus::Complete,
            nodes_written,
            nodes_skipped,
            edges_written,
            edges_dropped,
            error: None,
        })
    }

    /// Load the persisted state of a canvas in the client shape
    ///
    /// Ephemeral identifiers are re-derived from the payloads stamped at save
    /// time; nodes persisted without a stamp get a durable-derived name.
    pub async fn load(&self, canvas_id: i64) -> Result<CanvasSnapshot> {
        let nodes = self.store.load_nodes(canvas_id).await?;
        let edges = self.store.load_edges(canvas_id).await?;

        let snapshot_nodes: Vec<SnapshotNode> = nodes
            .into_iter()
            .map(|node| SnapshotNode {
                id: recover_node_client_id(&node.content, node.style.as_ref(), node.id),
                durable_id: node.id,
                kind: node.kind,
                content: node.content,
                position: node.position,
                width: node.width,
                height: node.height,
                style: node.style,
            })
            .collect();

        let snapshot_edges = edges
            .into_iter()
            .map(|edge| SnapshotEdge {
                durable_id: edge.id,
                source: recover_edge_endpoint(
                    edge.style.as_ref(),
                    "sourceClientId",
                    edge.source_id,
                ),
                target: recover_edge_endpoint(
                    edge.style.as_ref(),
                    "targetClientId",
                    edge.target_id,
                ),
                edge_type: edge.edge_type,
                animated: edge.animated,
                style: edge.style,
            })
            .collect();

        Ok(CanvasSnapshot {
            nodes: snapshot_nodes,
            edges: snapshot_edges,
        })
    }
}
