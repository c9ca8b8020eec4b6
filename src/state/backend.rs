use anyhow::Result;
use async_trait::async_trait;

use super::models::{Checkpoint, OperationState, ResourceKind, ResourceOwnership};

/// Durable persistence for idempotency records, so operation states,
/// checkpoints and leases survive process restarts.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    // ─── Initialization ─────────────────────────────────────────────────────

    /// Create tables if needed.
    async fn initialize(&self) -> Result<()>;

    // ─── Operation States ───────────────────────────────────────────────────

    /// Insert or replace an operation state.
    async fn save_operation_state(&self, state: &OperationState) -> Result<()>;

    async fn load_operation_states(&self) -> Result<Vec<OperationState>>;

    async fn delete_operation_state(&self, id: &str) -> Result<()>;

    // ─── Checkpoints ────────────────────────────────────────────────────────

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// All checkpoints, oldest first.
    async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>>;

    async fn delete_checkpoint(&self, id: &str) -> Result<()>;

    // ─── Ownership ──────────────────────────────────────────────────────────

    async fn save_ownership(&self, lease: &ResourceOwnership) -> Result<()>;

    async fn load_ownerships(&self) -> Result<Vec<ResourceOwnership>>;

    async fn delete_ownership(&self, kind: ResourceKind, resource_id: &str) -> Result<()>;
}
