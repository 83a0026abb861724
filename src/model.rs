//! Canvas Data Model
//!
//! This module defines the entity types for the collaborative canvas system:
//! canvases, content nodes, the edges between them, and the transient client
//! shapes submitted at save time.
//!
//! Two identifier spaces coexist. Durable identifiers (`i64`) are assigned by
//! the store on insert and are immutable afterwards. Ephemeral identifiers
//! (`String`) are minted by the editing client before persistence exists and
//! only survive a save/load cycle because they are stamped redundantly into
//! content and style payloads (see [`crate::reconcile`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Visibility mode of a canvas
///
/// Visibility fully determines default access; the owner always has access
/// regardless of visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Only the owner can view or edit
    Private,
    /// Invited collaborators can view and edit
    Collaborative,
    /// Anyone can view
    Public,
}

impl Visibility {
    /// Legacy public flag derived from visibility
    ///
    /// The boolean column is kept for compatibility with older readers;
    /// visibility is the authoritative representation and the flag is
    /// refreshed atomically whenever visibility changes.
    #[must_use]
    pub fn is_public(self) -> bool {
        matches!(self, Self::Public)
    }

    /// String form used in the store
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Collaborative => "collaborative",
            Self::Public => "public",
        }
    }

    /// Parse the stored string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "collaborative" => Some(Self::Collaborative),
            "public" => Some(Self::Public),
            _ => None,
        }
    }
}

/// Semantic kind of a canvas node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Free-form text
    Text,
    /// Image reference
    Image,
    /// Rendered equation
    Equation,
    /// Diagram source
    Diagram,
    /// Code snippet
    Code,
    /// External resource link
    Resource,
}

impl NodeKind {
    /// String form used in the store and on the wire
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Equation => "equation",
            Self::Diagram => "diagram",
            Self::Code => "code",
            Self::Resource => "resource",
        }
    }

    /// Parse the wire/store string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "equation" => Some(Self::Equation),
            "diagram" => Some(Self::Diagram),
            "code" => Some(Self::Code),
            "resource" => Some(Self::Resource),
            _ => None,
        }
    }
}

/// Position of a node on the canvas
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

/// A collaborative canvas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Canvas {
    /// Durable canvas identifier
    pub id: i64,
    /// Owning user
    pub owner_id: i64,
    /// Display title
    pub title: String,
    /// Visibility mode (authoritative access representation)
    pub visibility: Visibility,
    /// When the canvas was created
    pub created_at: DateTime<Utc>,
    /// When canvas state was last replaced
    pub updated_at: DateTime<Utc>,
}

impl Canvas {
    /// Whether a user may view this canvas
    #[must_use]
    pub fn can_view(&self, user_id: i64) -> bool {
        user_id == self.owner_id || self.visibility != Visibility::Private
    }
}

/// A persisted canvas node, as read from the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedNode {
    /// Durable identifier assigned on insert
    pub id: i64,
    /// Owning canvas
    pub canvas_id: i64,
    /// Semantic kind
    pub kind: NodeKind,
    /// Free-form structured content payload
    pub content: serde_json::Value,
    /// Position on the canvas
    pub position: Position,
    /// Optional width
    pub width: Option<f64>,
    /// Optional height
    pub height: Option<f64>,
    /// Optional style payload
    pub style: Option<serde_json::Value>,
}

/// A persisted edge between two nodes, as read from the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEdge {
    /// Durable identifier assigned on insert
    pub id: i64,
    /// Owning canvas
    pub canvas_id: i64,
    /// Durable id of the source node
    pub source_id: i64,
    /// Durable id of the target node
    pub target_id: i64,
    /// Rendering type hint
    pub edge_type: Option<String>,
    /// Whether the edge is rendered animated
    pub animated: bool,
    /// Rendering/style payload
    pub style: Option<serde_json::Value>,
}

/// A node as submitted by the editing client at save time
///
/// All fields except the ephemeral id are tolerated missing; elements without
/// a content payload or a recognizable kind are skipped during replacement
/// rather than aborting the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingNode {
    /// Ephemeral identifier minted by the editing session
    pub id: String,
    /// Node kind string (`text`, `image`, ...)
    #[serde(default)]
    pub kind: Option<String>,
    /// Content payload
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    /// Position on the canvas
    #[serde(default)]
    pub position: Position,
    /// Optional width
    #[serde(default)]
    pub width: Option<f64>,
    /// Optional height
    #[serde(default)]
    pub height: Option<f64>,
    /// Optional style payload
    #[serde(default)]
    pub style: Option<serde_json::Value>,
}

/// An edge as submitted by the editing client at save time
///
/// Endpoint references are ephemeral identifiers and may appear either in the
/// direct `source`/`target` fields or nested inside the style payload under
/// conventional key names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingEdge {
    /// Ephemeral edge identifier, if the client assigned one
    #[serde(default)]
    pub id: Option<String>,
    /// Ephemeral id of the source node
    #[serde(default)]
    pub source: Option<String>,
    /// Ephemeral id of the target node
    #[serde(default)]
    pub target: Option<String>,
    /// Rendering type hint
    #[serde(default, rename = "type")]
    pub edge_type: Option<String>,
    /// Whether the edge is rendered animated
    #[serde(default)]
    pub animated: bool,
    /// Rendering/style payload
    #[serde(default)]
    pub style: Option<serde_json::Value>,
}
