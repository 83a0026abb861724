//! Identifier Reconciler
//!
//! The editing client addresses nodes by ephemeral string identifiers it
//! minted during the session; the store addresses them by durable integer
//! identifiers it mints on insert. No mapping table survives across requests,
//! so both identifier forms have to be reconstructible by payload inspection
//! alone. That drives two obligations on every save:
//!
//! 1. stamp each node's canonical ephemeral id redundantly into its content
//!    and style payloads before insert, so the next load can recover it;
//! 2. resolve each edge's endpoints through a prioritized list of
//!    (payload-location, key-name) rules, falling back to harvested aliases,
//!    and re-stamp both identifier forms into the edge style on write.
//!
//! The fallback order is a first-class policy here, not incidental code
//! structure: explicit client-id keys before generic source/target keys, and
//! the primary mapping before the alias mapping.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::{IncomingEdge, IncomingNode};

/// Payload keys under which a node's ephemeral id may appear
pub const NODE_CLIENT_ID_KEYS: &[&str] = &["clientId", "_clientId", "originalId"];

/// Style keys tried when resolving an edge source, in priority order
pub const EDGE_SOURCE_KEYS: &[&str] = &["sourceClientId", "sourceId"];

/// Style keys tried when resolving an edge target, in priority order
pub const EDGE_TARGET_KEYS: &[&str] = &["targetClientId", "targetId"];

/// Mapping from ephemeral to durable identifiers, built incrementally as
/// inserts complete
#[derive(Debug, Default)]
pub struct IdMap {
    primary: HashMap<String, i64>,
    aliases: HashMap<String, String>,
}

impl IdMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a canonical ephemeral id and its durable counterpart
    pub fn record(&mut self, ephemeral: &str, durable: i64) {
        self.primary.insert(ephemeral.to_string(), durable);
    }

    /// Record an alternate ephemeral id as an alias of a canonical one
    pub fn record_alias(&mut self, alias: &str, canonical: &str) {
        if alias != canonical {
            self.aliases.insert(alias.to_string(), canonical.to_string());
        }
    }

    /// Resolve an ephemeral id to a durable one: primary map first, then the
    /// alias map routed back through the primary map
    #[must_use]
    pub fn resolve(&self, ephemeral: &str) -> Option<i64> {
        if let Some(&durable) = self.primary.get(ephemeral) {
            return Some(durable);
        }
        self.aliases
            .get(ephemeral)
            .and_then(|canonical| self.primary.get(canonical).copied())
    }

    /// Canonical ephemeral id for a durable id handed out by the store
    #[must_use]
    pub fn ephemeral_for(&self, durable: i64) -> Option<&str> {
        self.primary
            .iter()
            .find(|(_, &d)| d == durable)
            .map(|(ephemeral, _)| ephemeral.as_str())
    }

    /// Number of canonical mappings recorded
    #[must_use]
    pub fn len(&self) -> usize {
        self.primary.len()
    }

    /// Whether no canonical mapping has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }
}

fn as_object_mut(value: &mut Option<Value>) -> &mut serde_json::Map<String, Value> {
    if !matches!(value, Some(Value::Object(_))) {
        *value = Some(Value::Object(serde_json::Map::new()));
    }
    match value {
        Some(Value::Object(map)) => map,
        _ => unreachable!(),
    }
}

fn str_key<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Stamp a node's canonical ephemeral id into both its content and style
/// payloads, so a later load can recover it without a side table
pub fn stamp_node(node: &mut IncomingNode) {
    let ephemeral = node.id.clone();
    let content = as_object_mut(&mut node.content);
    content.insert("clientId".to_string(), Value::String(ephemeral.clone()));
    content.insert("_clientId".to_string(), Value::String(ephemeral.clone()));
    let style = as_object_mut(&mut node.style);
    style.insert("clientId".to_string(), Value::String(ephemeral));
}

/// Harvest alternate ephemeral ids embedded in a node's content and style
/// payloads as aliases of its canonical id
pub fn harvest_aliases(map: &mut IdMap, node: &IncomingNode) {
    for payload in [node.content.as_ref(), node.style.as_ref()]
        .into_iter()
        .flatten()
    {
        for key in NODE_CLIENT_ID_KEYS {
            if let Some(alias) = str_key(payload, key) {
                map.record_alias(alias, &node.id);
            }
        }
    }
}

/// Resolve one edge endpoint to a durable id
///
/// Priority: the direct (canonical) ephemeral reference, then each style key
/// in order; every candidate is tried against the primary map before the
/// alias map (inside [`IdMap::resolve`]).
#[must_use]
pub fn resolve_endpoint(
    direct: Option<&str>,
    style: Option<&Value>,
    keys: &[&str],
    map: &IdMap,
) -> Option<i64> {
    if let Some(durable) = direct.and_then(|id| map.resolve(id)) {
        return Some(durable);
    }
    let style = style?;
    for key in keys {
        if let Some(durable) = str_key(style, key).and_then(|id| map.resolve(id)) {
            return Some(durable);
        }
    }
    None
}

/// Resolve an edge's source endpoint
#[must_use]
pub fn resolve_source(edge: &IncomingEdge, map: &IdMap) -> Option<i64> {
    resolve_endpoint(
        edge.source.as_deref(),
        edge.style.as_ref(),
        EDGE_SOURCE_KEYS,
        map,
    )
}

/// Resolve an edge's target endpoint
#[must_use]
pub fn resolve_target(edge: &IncomingEdge, map: &IdMap) -> Option<i64> {
    resolve_endpoint(
        edge.target.as_deref(),
        edge.style.as_ref(),
        EDGE_TARGET_KEYS,
        map,
    )
}

/// Stamp both identifier pairs (ephemeral and durable, source and target)
/// into an edge's style payload before it is persisted, closing the loop for
/// the next load cycle
pub fn stamp_edge(
    edge: &mut IncomingEdge,
    source_ephemeral: &str,
    target_ephemeral: &str,
    source_durable: i64,
    target_durable: i64,
) {
    let style = as_object_mut(&mut edge.style);
    style.insert(
        "sourceClientId".to_string(),
        Value::String(source_ephemeral.to_string()),
    );
    style.insert(
        "targetClientId".to_string(),
        Value::String(target_ephemeral.to_string()),
    );
    style.insert("sourceId".to_string(), Value::from(source_durable));
    style.insert("targetId".to_string(), Value::from(target_durable));
}

/// Recover a node's ephemeral id from its persisted payloads, falling back to
/// a name derived from the durable id
#[must_use]
pub fn recover_node_client_id(
    content: &Value,
    style: Option<&Value>,
    durable_id: i64,
) -> String {
    for payload in std::iter::once(content).chain(style) {
        for key in NODE_CLIENT_ID_KEYS {
            if let Some(id) = str_key(payload, key) {
                return id.to_string();
            }
        }
    }
    format!("node-{durable_id}")
}

/// Recover an edge endpoint's ephemeral id from the persisted edge style,
/// falling back to the durable-derived node name
#[must_use]
pub fn recover_edge_endpoint(style: Option<&Value>, key: &str, durable_id: i64) -> String {
    style
        .and_then(|s| str_key(s, key))
        .map(str::to_string)
        .unwrap_or_else(|| format!("node-{durable_id}"))
}
