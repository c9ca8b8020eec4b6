use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::IdempotencyConfig;
use crate::planner::plan::OperationStatus;
use crate::state::backend::IdempotencyStore;
use crate::state::models::{Checkpoint, OperationState, ResourceKind, ResourceOwnership};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyError {
    #[error("operation state '{0}' already exists")]
    StateExists(String),

    #[error("operation state '{0}' not found")]
    StateNotFound(String),

    #[error("{kind}/{resource_id} is owned by plan '{owner_plan_id}' until {expires_at}")]
    OwnedByOther {
        kind: ResourceKind,
        resource_id: String,
        owner_plan_id: String,
        expires_at: String,
    },

    #[error("plan '{plan_id}' does not own {kind}/{resource_id}")]
    NotOwner {
        kind: ResourceKind,
        resource_id: String,
        plan_id: String,
    },
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub states: usize,
    pub leases: usize,
    pub checkpoints: usize,
}

#[derive(Debug, Default)]
struct Records {
    states: HashMap<String, OperationState>,
    ownership: HashMap<(ResourceKind, String), ResourceOwnership>,
    /// Per operation, oldest first.
    checkpoints: HashMap<String, Vec<Checkpoint>>,
}

/// Write-through actions computed under the lock and performed after it is
/// released.
enum Persist {
    State(OperationState),
    DeleteState(String),
    Checkpoint(Checkpoint),
    DeleteCheckpoint(String),
    Lease(ResourceOwnership),
    DeleteLease(ResourceKind, String),
}

/// Tracks operation states, resource ownership leases and checkpoints.
///
/// Mutators serialize under the write lock and readers share the read lock.
/// No lock is held across an await; store writes happen after release.
pub struct IdempotencyManager {
    records: RwLock<Records>,
    config: IdempotencyConfig,
    store: Option<Arc<dyn IdempotencyStore>>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl IdempotencyManager {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            records: RwLock::new(Records::default()),
            config,
            store: None,
            worker: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, actions: Vec<Persist>) {
        let Some(store) = &self.store else {
            return;
        };
        for action in actions {
            let outcome = match &action {
                Persist::State(state) => store.save_operation_state(state).await,
                Persist::DeleteState(id) => store.delete_operation_state(id).await,
                Persist::Checkpoint(cp) => store.save_checkpoint(cp).await,
                Persist::DeleteCheckpoint(id) => store.delete_checkpoint(id).await,
                Persist::Lease(lease) => store.save_ownership(lease).await,
                Persist::DeleteLease(kind, id) => store.delete_ownership(*kind, id).await,
            };
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "Failed to persist idempotency record");
            }
        }
    }

    /// Load every record from the durable store, replacing in-memory state.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        store.initialize().await?;
        let states = store.load_operation_states().await?;
        let leases = store.load_ownerships().await?;
        let checkpoints = store.load_checkpoints().await?;

        let mut records = self.write();
        *records = Records::default();
        let restored = states.len();
        for state in states {
            records.states.insert(state.id.clone(), state);
        }
        for lease in leases {
            records
                .ownership
                .insert((lease.resource_kind, lease.resource_id.clone()), lease);
        }
        for cp in checkpoints {
            records.checkpoints.entry(cp.operation_id.clone()).or_default().push(cp);
        }
        tracing::info!(states = restored, "Restored idempotency records");
        Ok(restored)
    }

    // ─── Operation States ───────────────────────────────────────────────────

    /// Record a new operation. At most one state exists per operation id.
    pub async fn create_operation_state(&self, state: OperationState) -> Result<(), IdempotencyError> {
        {
            let mut records = self.write();
            if records.states.contains_key(&state.id) {
                return Err(IdempotencyError::StateExists(state.id));
            }
            records.states.insert(state.id.clone(), state.clone());
        }
        self.persist(vec![Persist::State(state)]).await;
        Ok(())
    }

    pub fn get_operation_state(&self, id: &str) -> Option<OperationState> {
        self.read().states.get(id).cloned()
    }

    /// Apply `f` to a state and bump its update time.
    pub async fn update_operation_state<F>(&self, id: &str, f: F) -> Result<OperationState, IdempotencyError>
    where
        F: FnOnce(&mut OperationState),
    {
        let updated = {
            let mut records = self.write();
            let state = records
                .states
                .get_mut(id)
                .ok_or_else(|| IdempotencyError::StateNotFound(id.to_string()))?;
            f(state);
            state.updated_at = Utc::now();
            state.clone()
        };
        self.persist(vec![Persist::State(updated.clone())]).await;
        Ok(updated)
    }

    /// Set the status, stamping start and completion times.
    pub async fn set_status(&self, id: &str, status: OperationStatus) -> Result<OperationState, IdempotencyError> {
        self.update_operation_state(id, |state| {
            let now = Utc::now();
            state.status = status;
            match status {
                OperationStatus::Running => {
                    state.started_at.get_or_insert(now);
                }
                s if s.is_terminal() => state.completed_at = Some(now),
                _ => {}
            }
        })
        .await
    }

    /// True when this operation already completed with the same fingerprint.
    pub fn is_operation_idempotent(&self, operation_id: &str, fingerprint: &str) -> bool {
        self.read().states.get(operation_id).is_some_and(|s| {
            s.fingerprint == fingerprint
                && matches!(s.status, OperationStatus::Completed | OperationStatus::Skipped)
        })
    }

    /// Non-failed states for the same resource inside the deduplication
    /// window, newest first.
    pub fn find_duplicates(&self, kind: ResourceKind, resource_id: &str, exclude_id: &str) -> Vec<OperationState> {
        let cutoff = Utc::now() - self.config.dedup_window();
        let mut found: Vec<OperationState> = self
            .read()
            .states
            .values()
            .filter(|s| {
                s.id != exclude_id
                    && s.resource_kind == kind
                    && s.resource_id == resource_id
                    && s.status != OperationStatus::Failed
                    && s.created_at >= cutoff
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    pub fn is_duplicate_operation(&self, kind: ResourceKind, resource_id: &str, operation_id: &str) -> bool {
        !self.find_duplicates(kind, resource_id, operation_id).is_empty()
    }

    /// States recorded for resources of one project.
    pub fn states_for_project(&self, project_id: &str) -> Vec<OperationState> {
        let mut states: Vec<OperationState> = self
            .read()
            .states
            .values()
            .filter(|s| s.project_id() == Some(project_id))
            .cloned()
            .collect();
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        states
    }

    pub fn state_count(&self) -> usize {
        self.read().states.len()
    }

    // ─── Ownership ──────────────────────────────────────────────────────────

    /// Take or extend the lease on a resource. Fails while another plan holds
    /// an unexpired lease.
    pub async fn acquire_resource_ownership(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        plan_id: &str,
        operation_id: &str,
    ) -> Result<ResourceOwnership, IdempotencyError> {
        let lease = {
            let mut records = self.write();
            let now = Utc::now();
            let key = (kind, resource_id.to_string());
            if let Some(existing) = records.ownership.get(&key) {
                if existing.owner_plan_id != plan_id && !existing.is_expired(now) {
                    return Err(IdempotencyError::OwnedByOther {
                        kind,
                        resource_id: resource_id.to_string(),
                        owner_plan_id: existing.owner_plan_id.clone(),
                        expires_at: existing.expires_at.to_rfc3339(),
                    });
                }
            }
            let acquired_at = match records.ownership.get(&key) {
                Some(existing) if existing.owner_plan_id == plan_id && !existing.is_expired(now) => {
                    existing.acquired_at
                }
                _ => now,
            };
            let lease = ResourceOwnership {
                resource_kind: kind,
                resource_id: resource_id.to_string(),
                owner_plan_id: plan_id.to_string(),
                owner_op_id: operation_id.to_string(),
                acquired_at,
                expires_at: now + self.config.ownership_ttl(),
            };
            records.ownership.insert(key, lease.clone());
            lease
        };
        tracing::debug!(
            resource_kind = %kind,
            resource_name = resource_id,
            plan_id,
            "Acquired resource ownership"
        );
        self.persist(vec![Persist::Lease(lease.clone())]).await;
        Ok(lease)
    }

    /// Release a lease. Only the owning plan may release it.
    pub async fn release_resource_ownership(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        plan_id: &str,
    ) -> Result<(), IdempotencyError> {
        {
            let mut records = self.write();
            let key = (kind, resource_id.to_string());
            match records.ownership.get(&key) {
                Some(lease) if lease.owner_plan_id == plan_id => {
                    records.ownership.remove(&key);
                }
                _ => {
                    return Err(IdempotencyError::NotOwner {
                        kind,
                        resource_id: resource_id.to_string(),
                        plan_id: plan_id.to_string(),
                    })
                }
            }
        }
        self.persist(vec![Persist::DeleteLease(kind, resource_id.to_string())])
            .await;
        Ok(())
    }

    pub fn get_resource_ownership(&self, kind: ResourceKind, resource_id: &str) -> Option<ResourceOwnership> {
        self.read()
            .ownership
            .get(&(kind, resource_id.to_string()))
            .cloned()
    }

    // ─── Checkpoints ────────────────────────────────────────────────────────

    pub async fn create_checkpoint(
        &self,
        operation_id: &str,
        plan_id: &str,
        stage: &str,
        data: serde_json::Value,
        resource_state: Option<crate::state::models::Resource>,
    ) -> Checkpoint {
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            operation_id: operation_id.to_string(),
            plan_id: plan_id.to_string(),
            stage: stage.to_string(),
            created_at: Utc::now(),
            data,
            resource_state,
        };
        let mut actions = vec![Persist::Checkpoint(checkpoint.clone())];
        {
            let mut records = self.write();
            records
                .checkpoints
                .entry(operation_id.to_string())
                .or_default()
                .push(checkpoint.clone());
            if let Some(state) = records.states.get_mut(operation_id) {
                state.last_checkpoint = Some(checkpoint.id.clone());
                state
                    .checkpoint_data
                    .insert(stage.to_string(), checkpoint.data.clone());
                state.updated_at = checkpoint.created_at;
                actions.push(Persist::State(state.clone()));
            }
        }
        self.persist(actions).await;
        checkpoint
    }

    pub fn get_latest_checkpoint(&self, operation_id: &str) -> Option<Checkpoint> {
        self.read()
            .checkpoints
            .get(operation_id)
            .and_then(|cps| cps.last().cloned())
    }

    /// Latest checkpoint of an operation at a given stage.
    pub fn get_checkpoint(&self, operation_id: &str, stage: &str) -> Option<Checkpoint> {
        self.read()
            .checkpoints
            .get(operation_id)
            .and_then(|cps| cps.iter().rev().find(|cp| cp.stage == stage).cloned())
    }

    pub fn checkpoints(&self, operation_id: &str) -> Vec<Checkpoint> {
        self.read()
            .checkpoints
            .get(operation_id)
            .cloned()
            .unwrap_or_default()
    }

    // ─── Cleanup ────────────────────────────────────────────────────────────

    /// Drop states older than the TTL, expired leases, and all but the most
    /// recent checkpoints of each operation.
    pub async fn cleanup_expired_state(&self) -> CleanupReport {
        let now = Utc::now();
        let state_cutoff = now - self.config.state_ttl();
        let keep = self.config.max_checkpoints_per_operation;
        let mut report = CleanupReport::default();
        let mut actions = Vec::new();

        {
            let mut records = self.write();

            let stale: Vec<String> = records
                .states
                .values()
                .filter(|s| s.updated_at < state_cutoff)
                .map(|s| s.id.clone())
                .collect();
            for id in stale {
                records.states.remove(&id);
                if let Some(cps) = records.checkpoints.remove(&id) {
                    report.checkpoints += cps.len();
                    actions.extend(cps.into_iter().map(|cp| Persist::DeleteCheckpoint(cp.id)));
                }
                actions.push(Persist::DeleteState(id));
                report.states += 1;
            }

            let expired: Vec<(ResourceKind, String)> = records
                .ownership
                .iter()
                .filter(|(_, lease)| lease.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                records.ownership.remove(&key);
                actions.push(Persist::DeleteLease(key.0, key.1));
                report.leases += 1;
            }

            for cps in records.checkpoints.values_mut() {
                if cps.len() > keep {
                    let excess = cps.len() - keep;
                    for cp in cps.drain(..excess) {
                        actions.push(Persist::DeleteCheckpoint(cp.id));
                        report.checkpoints += 1;
                    }
                }
            }
        }

        self.persist(actions).await;
        if report != CleanupReport::default() {
            tracing::debug!(
                states = report.states,
                leases = report.leases,
                checkpoints = report.checkpoints,
                "Cleaned up idempotency records"
            );
        }
        report
    }

    /// Start the periodic cleanup worker, stopped by `stop` or by cancelling
    /// `parent`. Starting twice is a no-op.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let token = parent.child_token();
        let child = token.clone();
        let manager = Arc::clone(self);
        let interval = self.config.cleanup_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        manager.cleanup_expired_state().await;
                    }
                }
            }
        });
        *worker = Some((token, handle));
    }

    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = worker {
            token.cancel();
            let _ = handle.await;
        }
    }

    /// Operation counts by status, for reporting.
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for state in self.read().states.values() {
            *counts.entry(state.status.to_string()).or_insert(0) += 1;
        }
        counts
    }
}
