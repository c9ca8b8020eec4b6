use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::backend::IdempotencyStore;
use super::models::{Checkpoint, OperationState, ResourceKind, ResourceOwnership};
use super::schema;

/// SQLite-backed idempotency store.
pub struct SqliteIdempotencyStore {
    conn: Mutex<Connection>,
}

impl SqliteIdempotencyStore {
    /// Open or create the store database.
    pub fn open(db_path: &str) -> Result<Self> {
        let parent = Path::new(db_path).parent();
        if let Some(dir) = parent {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open idempotency database at {}", db_path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    // ─── Initialization ─────────────────────────────────────────────────────

    async fn initialize(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(schema::CREATE_TABLES_SQL)?;
        conn.execute_batch(schema::CREATE_INDEXES_SQL)?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            params![schema::SCHEMA_VERSION, Self::now(), "Initial schema"],
        )?;
        Ok(())
    }

    // ─── Operation States ───────────────────────────────────────────────────

    async fn save_operation_state(&self, state: &OperationState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO operation_states
                (id, plan_id, resource_kind, resource_id, status, fingerprint, created_at, updated_at, state_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                fingerprint = excluded.fingerprint,
                updated_at = excluded.updated_at,
                state_json = excluded.state_json",
            params![
                state.id,
                state.plan_id,
                state.resource_kind.as_str(),
                state.resource_id,
                state.status.to_string(),
                state.fingerprint,
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
                json,
            ],
        )?;
        Ok(())
    }

    async fn load_operation_states(&self) -> Result<Vec<OperationState>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT state_json FROM operation_states ORDER BY created_at")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("Corrupt operation state row"))
            .collect()
    }

    async fn delete_operation_state(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM operation_states WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ─── Checkpoints ────────────────────────────────────────────────────────

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_string(checkpoint)?;
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints
                (id, operation_id, plan_id, stage, created_at, checkpoint_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkpoint.id,
                checkpoint.operation_id,
                checkpoint.plan_id,
                checkpoint.stage,
                checkpoint.created_at.to_rfc3339(),
                json,
            ],
        )?;
        Ok(())
    }

    async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT checkpoint_json FROM checkpoints ORDER BY created_at, rowid")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("Corrupt checkpoint row"))
            .collect()
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM checkpoints WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ─── Ownership ──────────────────────────────────────────────────────────

    async fn save_ownership(&self, lease: &ResourceOwnership) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO resource_ownership
                (resource_kind, resource_id, owner_plan_id, owner_op_id, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                lease.resource_kind.as_str(),
                lease.resource_id,
                lease.owner_plan_id,
                lease.owner_op_id,
                lease.acquired_at.to_rfc3339(),
                lease.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn load_ownerships(&self) -> Result<Vec<ResourceOwnership>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT resource_kind, resource_id, owner_plan_id, owner_op_id, acquired_at, expires_at
             FROM resource_ownership ORDER BY acquired_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(kind, resource_id, owner_plan_id, owner_op_id, acquired, expires)| {
                Ok(ResourceOwnership {
                    resource_kind: kind.parse()?,
                    resource_id,
                    owner_plan_id,
                    owner_op_id,
                    acquired_at: parse_time(&acquired)?,
                    expires_at: parse_time(&expires)?,
                })
            })
            .collect()
    }

    async fn delete_ownership(&self, kind: ResourceKind, resource_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM resource_ownership WHERE resource_kind = ?1 AND resource_id = ?2",
            params![kind.as_str(), resource_id],
        )?;
        Ok(())
    }
}
