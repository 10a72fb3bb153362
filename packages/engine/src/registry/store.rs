// packages/engine/src/registry/store.rs
//! SQLite persistence for agent descriptors
//!
//! Each descriptor is stored as a JSON document keyed by agent id. The
//! registry stays the source of truth at runtime; the store only makes
//! registrations survive a restart and backs the storage health check.

use crate::registry::descriptor::AgentDescriptor;
use crate::utils::errors::{EngineError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable descriptor store
#[derive(Clone)]
pub struct DescriptorStore {
    db: Arc<Mutex<Connection>>,
}

impl DescriptorStore {
    /// Open (or create) the database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::StorageFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to open database: {}", e))
        })?;

        let store = Self::from_connection(conn).await?;
        info!("Descriptor store opened at {:?}", path);
        Ok(store)
    }

    /// In-memory store, used by tests and ephemeral deployments
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            db: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS agent_descriptors (
                agent_id TEXT PRIMARY KEY,
                descriptor TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;
        Ok(())
    }

    /// Insert or replace the stored record for `descriptor.id`
    pub async fn upsert(&self, descriptor: &AgentDescriptor) -> Result<()> {
        let document = serde_json::to_value(descriptor)
            .map_err(|e| EngineError::StorageFailed(format!("Serialization failed: {}", e)))?;

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO agent_descriptors (agent_id, descriptor, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(agent_id) DO UPDATE SET
                descriptor = excluded.descriptor,
                updated_at = excluded.updated_at
            "#,
            params![descriptor.id, document, chrono::Utc::now().timestamp()],
        )?;

        debug!(agent_id = %descriptor.id, "Persisted descriptor");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<AgentDescriptor>> {
        let db = self.db.lock().await;
        let document: Option<serde_json::Value> = db
            .query_row(
                "SELECT descriptor FROM agent_descriptors WHERE agent_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        document.map(decode).transpose()
    }

    /// All stored descriptors, ordered by agent id
    pub async fn load_all(&self) -> Result<Vec<AgentDescriptor>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT descriptor FROM agent_descriptors ORDER BY agent_id")?;
        let documents = stmt
            .query_map([], |row| row.get::<_, serde_json::Value>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        documents.into_iter().map(decode).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let removed = db.execute(
            "DELETE FROM agent_descriptors WHERE agent_id = ?1",
            params![id],
        )?;
        Ok(removed > 0)
    }

    /// Liveness check for the health endpoint
    pub async fn ping(&self) -> bool {
        let db = self.db.lock().await;
        db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|one| one == 1)
            .unwrap_or(false)
    }
}

fn decode(document: serde_json::Value) -> Result<AgentDescriptor> {
    serde_json::from_value(document)
        .map_err(|e| EngineError::StorageFailed(format!("Corrupt descriptor row: {}", e)))
}
