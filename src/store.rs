//! Canvas Store
//!
//! Persistence boundary for canvas state. The core depends only on the
//! [`CanvasStore`] trait (the operations in the external interface contract);
//! [`SqliteCanvasStore`] is the concrete SQLite implementation.
//!
//! Durable node and edge identifiers are SQLite rowids, returned from each
//! insert so the identifier reconciler can build its mapping incrementally.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};

use crate::error::Result;
use crate::model::{Canvas, NodeKind, PersistedEdge, PersistedNode, Position, Visibility};

/// Operations the core needs from the relational store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CanvasStore: Send + Sync {
    /// Insert a node and return its durable id
    async fn insert_node<'a>(
        &self,
        canvas_id: i64,
        kind: NodeKind,
        content: &'a Value,
        position: Position,
        width: Option<f64>,
        height: Option<f64>,
        style: Option<&'a Value>,
    ) -> Result<i64>;

    /// Insert an edge between two durable node ids and return its durable id
    async fn insert_edge<'a>(
        &self,
        canvas_id: i64,
        source_id: i64,
        target_id: i64,
        edge_type: Option<&'a str>,
        animated: bool,
        style: Option<&'a Value>,
    ) -> Result<i64>;

    /// Delete every node on a canvas; returns the number deleted
    async fn delete_all_nodes(&self, canvas_id: i64) -> Result<u64>;

    /// Delete every edge on a canvas; returns the number deleted
    async fn delete_all_edges(&self, canvas_id: i64) -> Result<u64>;

    /// Bump the canvas's modification timestamp
    async fn touch_canvas(&self, canvas_id: i64) -> Result<bool>;

    /// Read every node on a canvas
    async fn load_nodes(&self, canvas_id: i64) -> Result<Vec<PersistedNode>>;

    /// Read every edge on a canvas
    async fn load_edges(&self, canvas_id: i64) -> Result<Vec<PersistedEdge>>;
}

/// SQLite-backed canvas store
pub struct SqliteCanvasStore {
    pool: SqlitePool,
}

impl SqliteCanvasStore {
    /// Create a store over an existing pool
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canvases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                visibility TEXT NOT NULL DEFAULT 'private',
                is_public INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS canvas_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canvas_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                pos_x REAL NOT NULL DEFAULT 0,
                pos_y REAL NOT NULL DEFAULT 0,
                width REAL,
                height REAL,
                style TEXT
            );

            CREATE TABLE IF NOT EXISTS canvas_edges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canvas_id INTEGER NOT NULL,
                source_id INTEGER NOT NULL,
                target_id INTEGER NOT NULL,
                edge_type TEXT,
                animated INTEGER NOT NULL DEFAULT 0,
                style TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_canvas ON canvas_nodes(canvas_id);
            CREATE INDEX IF NOT EXISTS idx_edges_canvas ON canvas_edges(canvas_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create a canvas and return it
    pub async fn create_canvas(
        &self,
        owner_id: i64,
        title: &str,
        visibility: Visibility,
    ) -> Result<Canvas> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO canvases (owner_id, title, visibility, is_public, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(owner_id)
        .bind(title)
        .bind(visibility.as_str())
        .bind(visibility.is_public())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(Canvas {
            id: row.get("id"),
            owner_id,
            title: title.to_string(),
            visibility,
            created_at: now,
            updated_at: now,
        })
    }

    /// Load a canvas by id
    pub async fn get_canvas(&self, canvas_id: i64) -> Result<Option<Canvas>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, title, visibility, created_at, updated_at
            FROM canvases WHERE id = ?
            "#,
        )
        .bind(canvas_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let visibility: String = row.get("visibility");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(Some(Canvas {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            title: row.get("title"),
            visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Private),
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        }))
    }

    /// Change a canvas's visibility
    ///
    /// Visibility is authoritative; the legacy public flag is refreshed in
    /// the same statement so the two can never disagree.
    pub async fn set_visibility(&self, canvas_id: i64, visibility: Visibility) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE canvases SET visibility = ?, is_public = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(visibility.as_str())
        .bind(visibility.is_public())
        .bind(Utc::now().to_rfc3339())
        .bind(canvas_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn json_column(row: &sqlx::sqlite::SqliteRow, name: &str) -> Option<Value> {
    let raw: Option<String> = row.get(name);
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

#[async_trait]
impl CanvasStore for SqliteCanvasStore {
    async fn insert_node<'a>(
        &self,
        canvas_id: i64,
        kind: NodeKind,
        content: &'a Value,
        position: Position,
        width: Option<f64>,
        height: Option<f64>,
        style: Option<&'a Value>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO canvas_nodes (canvas_id, kind, content, pos_x, pos_y, width, height, style)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(canvas_id)
        .bind(kind.as_str())
        .bind(serde_json::to_string(content)?)
        .bind(position.x)
        .bind(position.y)
        .bind(width)
        .bind(height)
        .bind(style.map(serde_json::to_string).transpose()?)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    async fn insert_edge<'a>(
        &self,
        canvas_id: i64,
        source_id: i64,
        target_id: i64,
        edge_type: Option<&'a str>,
        animated: bool,
        style: Option<&'a Value>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO canvas_edges (canvas_id, source_id, target_id, edge_type, animated, style)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(canvas_id)
        .bind(source_id)
        .bind(target_id)
        .bind(edge_type)
        .bind(animated)
        .bind(style.map(serde_json::to_string).transpose()?)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    async fn delete_all_nodes(&self, canvas_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM canvas_nodes WHERE canvas_id = ?")
            .bind(canvas_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_all_edges(&self, canvas_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM canvas_edges WHERE canvas_id = ?")
            .bind(canvas_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn touch_canvas(&self, canvas_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE canvases SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(canvas_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_nodes(&self, canvas_id: i64) -> Result<Vec<PersistedNode>> {
        let rows = sqlx::query(
            r#"
            SELECT id, canvas_id, kind, content, pos_x, pos_y, width, height, style
            FROM canvas_nodes WHERE canvas_id = ? ORDER BY id
            "#,
        )
        .bind(canvas_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let content: String = row.get("content");
                PersistedNode {
                    id: row.get("id"),
                    canvas_id: row.get("canvas_id"),
                    kind: NodeKind::parse(&kind).unwrap_or(NodeKind::Text),
                    content: serde_json::from_str(&content).unwrap_or(Value::Null),
                    position: Position {
                        x: row.get("pos_x"),
                        y: row.get("pos_y"),
                    },
                    width: row.get("width"),
                    height: row.get("height"),
                    style: json_column(row, "style"),
                }
            })
            .collect())
    }

    async fn load_edges(&self, canvas_id: i64) -> Result<Vec<PersistedEdge>> {
        let rows = sqlx::query(
            r#"
            SELECT id, canvas_id, source_id, target_id, edge_type, animated, style
            FROM canvas_edges WHERE canvas_id = ? ORDER BY id
            "#,
        )
        .bind(canvas_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PersistedEdge {
                id: row.get("id"),
                canvas_id: row.get("canvas_id"),
                source_id: row.get("source_id"),
                target_id: row.get("target_id"),
                edge_type: row.get("edge_type"),
                animated: row.get("animated"),
                style: json_column(row, "style"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqliteCanvasStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteCanvasStore::new(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_and_get_canvas() {
        let store = setup_test_db().await;
        let canvas = store
            .create_canvas(7, "Notes", Visibility::Collaborative)
            .await
            .unwrap();

        let loaded = store.get_canvas(canvas.id).await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, 7);
        assert_eq!(loaded.title, "Notes");
        assert_eq!(loaded.visibility, Visibility::Collaborative);

        assert!(store.get_canvas(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_visibility_syncs_legacy_flag() {
        let store = setup_test_db().await;
        let canvas = store
            .create_canvas(7, "Notes", Visibility::Private)
            .await
            .unwrap();

        store
            .set_visibility(canvas.id, Visibility::Public)
            .await
            .unwrap();

        let row = sqlx::query("SELECT visibility, is_public FROM canvases WHERE id = ?")
            .bind(canvas.id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let visibility: String = row.get("visibility");
        let is_public: bool = row.get("is_public");
        assert_eq!(visibility, "public");
        assert!(is_public);
    }

    #[tokio::test]
    async fn test_insert_and_load_nodes() {
        let store = setup_test_db().await;
        let canvas = store
            .create_canvas(1, "c", Visibility::Private)
            .await
            .unwrap();

        let id = store
            .insert_node(
                canvas.id,
                NodeKind::Equation,
                &json!({ "latex": "e^{i\\pi}+1=0" }),
                Position { x: 10.0, y: 20.0 },
                Some(200.0),
                None,
                Some(&json!({ "color": "blue" })),
            )
            .await
            .unwrap();
        assert!(id > 0);

        let nodes = store.load_nodes(canvas.id).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, id);
        assert_eq!(nodes[0].kind, NodeKind::Equation);
        assert_eq!(nodes[0].position.x, 10.0);
        assert_eq!(nodes[0].width, Some(200.0));
        assert_eq!(nodes[0].style.as_ref().unwrap()["color"], "blue");
    }

    #[tokio::test]
    async fn test_insert_returns_distinct_durable_ids() {
        let store = setup_test_db().await;
        let canvas = store
            .create_canvas(1, "c", Visibility::Private)
            .await
            .unwrap();

        let a = store
            .insert_node(
                canvas.id,
                NodeKind::Text,
                &json!({}),
                Position::default(),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        let b = store
            .insert_node(
                canvas.id,
                NodeKind::Text,
                &json!({}),
                Position::default(),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_insert_and_load_edges() {
        let store = setup_test_db().await;
        let canvas = store
            .create_canvas(1, "c", Visibility::Private)
            .await
            .unwrap();

        let a = store
            .insert_node(
                canvas.id,
                NodeKind::Text,
                &json!({}),
                Position::default(),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        let b = store
            .insert_node(
                canvas.id,
                NodeKind::Text,
                &json!({}),
                Position::default(),
                None,
                None,
                None,
            )
            .await
            .unwrap();

        store
            .insert_edge(canvas.id, a, b, Some("smoothstep"), true, None)
            .await
            .unwrap();

        let edges = store.load_edges(canvas.id).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source_id, a);
        assert_eq!(edges[0].target_id, b);
        assert_eq!(edges[0].edge_type.as_deref(), Some("smoothstep"));
        assert!(edges[0].animated);
    }

    #[tokio::test]
    async fn test_delete_all_is_canvas_scoped() {
        let store = setup_test_db().await;
        let c1 = store
            .create_canvas(1, "one", Visibility::Private)
            .await
            .unwrap();
        let c2 = store
            .create_canvas(1, "two", Visibility::Private)
            .await
            .unwrap();

        for canvas_id in [c1.id, c2.id] {
            store
                .insert_node(
                    canvas_id,
                    NodeKind::Text,
                    &json!({}),
                    Position::default(),
                    None,
                    None,
                    None,
                )
                .await
                .unwrap();
        }

        assert_eq!(store.delete_all_nodes(c1.id).await.unwrap(), 1);
        assert!(store.load_nodes(c1.id).await.unwrap().is_empty());
        assert_eq!(store.load_nodes(c2.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_touch_canvas_updates_timestamp() {
        let store = setup_test_db().await;
        let canvas = store
            .create_canvas(1, "c", Visibility::Private)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(store.touch_canvas(canvas.id).await.unwrap());

        let loaded = store.get_canvas(canvas.id).await.unwrap().unwrap();
        assert!(loaded.updated_at > canvas.updated_at);

        assert!(!store.touch_canvas(9999).await.unwrap());
    }
}
