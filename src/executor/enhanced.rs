use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{Executor, OperationRunner, PlanExecutor};
use super::progress::ExecutorProgress;
use super::result::{ErrorType, ExecutionError, ExecutionResult, OperationResult};
use crate::config::types::EngineConfig;
use crate::planner::plan::{OperationStatus, OperationType, Plan, PlannedOperation};
use crate::provider::registry::HandlerRegistry;
use crate::recovery::idempotency::IdempotencyManager;
use crate::recovery::manager::{RecoveryManager, RecoveryResult, PRE_EXECUTION};
use crate::state::cache::StateCache;
use crate::state::fingerprint::FingerprintEngine;
use crate::state::models::{OperationState, META_OPERATION_TYPE, META_PROJECT_ID};

pub const POST_EXECUTION: &str = "post-execution";
pub const POST_EXECUTION_FAILED: &str = "post-execution-failed";

/// Executor that records every operation for idempotency, skips operations
/// already proven done, checkpoints around each mutation and hands failures
/// to the recovery manager.
#[derive(Clone)]
pub struct EnhancedExecutor {
    base: Executor,
    idempotency: Arc<IdempotencyManager>,
    recovery: Arc<RecoveryManager>,
    fingerprints: FingerprintEngine,
    recoveries: Arc<DashMap<String, RecoveryResult>>,
}

/// Binds operations to the plan being executed.
struct PlanRunner {
    executor: EnhancedExecutor,
    plan_id: String,
}

#[async_trait]
impl OperationRunner for PlanRunner {
    async fn run(&self, project_id: &str, operation: &PlannedOperation, token: &CancellationToken) -> OperationResult {
        self.executor
            .run_tracked(&self.plan_id, project_id, operation, token)
            .await
    }
}

impl EnhancedExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, config: &EngineConfig, idempotency: Arc<IdempotencyManager>) -> Self {
        let recovery = RecoveryManager::new(Arc::clone(&registry), Arc::clone(&idempotency), config.recovery.clone());
        Self {
            base: Executor::new(registry, config),
            idempotency,
            recovery: Arc::new(recovery),
            fingerprints: FingerprintEngine::new(&config.fingerprint),
            recoveries: Arc::new(DashMap::new()),
        }
    }

    pub fn with_cache(mut self, cache: StateCache) -> Self {
        self.base = self.base.with_cache(cache);
        self
    }

    pub fn base(&self) -> &Executor {
        &self.base
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyManager> {
        &self.idempotency
    }

    /// Recovery outcome of a failed operation, if recovery ran for it.
    pub fn recovery_result(&self, operation_id: &str) -> Option<RecoveryResult> {
        self.recoveries.get(operation_id).map(|r| r.value().clone())
    }

    fn fingerprint(&self, op: &PlannedOperation) -> Option<String> {
        let resource = op.operation.resource()?;
        match self.fingerprints.fingerprint_resource(resource) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(operation_id = %op.id, error = %e, "Could not fingerprint resource");
                None
            }
        }
    }

    /// Whether an earlier state proves the operation is a no-op.
    ///
    /// A `NoChange` op is skipped when the newest state for the resource
    /// completed with the same content, in any plan. Mutations are only
    /// deduplicated within their own plan, so a later plan always
    /// re-dispatches a change the live state needs.
    fn completed_duplicate(
        &self,
        plan_id: &str,
        project_id: &str,
        op: &PlannedOperation,
        fingerprint: &str,
    ) -> Option<OperationState> {
        if !self.idempotency.config().enable_deduplication {
            return None;
        }
        let proves = |state: &OperationState| {
            matches!(state.status, OperationStatus::Completed | OperationStatus::Skipped)
                && state.fingerprint == fingerprint
                && state.project_id() == Some(project_id)
        };

        if op.op_type() == OperationType::NoChange {
            return self
                .idempotency
                .find_duplicates(op.kind(), op.name(), &op.id)
                .into_iter()
                .find(|state| state.project_id() == Some(project_id))
                .filter(|state| proves(state));
        }

        let op_type = op.op_type().to_string();
        if self.idempotency.is_operation_idempotent(&op.id, fingerprint) {
            return self.idempotency.get_operation_state(&op.id);
        }
        self.idempotency
            .find_duplicates(op.kind(), op.name(), &op.id)
            .into_iter()
            .find(|state| {
                state.plan_id == plan_id && proves(state) && state.operation_type() == Some(op_type.as_str())
            })
    }

    fn new_state(plan_id: &str, project_id: &str, op: &PlannedOperation, fingerprint: &str) -> OperationState {
        let now = Utc::now();
        let mut metadata = BTreeMap::new();
        metadata.insert(META_PROJECT_ID.to_string(), project_id.to_string());
        metadata.insert(META_OPERATION_TYPE.to_string(), op.op_type().to_string());
        OperationState {
            id: op.id.clone(),
            plan_id: plan_id.to_string(),
            status: OperationStatus::Pending,
            resource_kind: op.kind(),
            resource_id: op.name().to_string(),
            fingerprint: fingerprint.to_string(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error_history: Vec::new(),
            last_checkpoint: None,
            checkpoint_data: BTreeMap::new(),
            metadata,
        }
    }

    async fn record_state(&self, state: OperationState) {
        let id = state.id.clone();
        if let Err(e) = self.idempotency.create_operation_state(state).await {
            debug!(operation_id = %id, error = %e, "Reusing existing operation state");
            let _ = self.idempotency.set_status(&id, OperationStatus::Pending).await;
        }
    }

    // ─── Tracked Execution ──────────────────────────────────────────────────

    async fn run_tracked(
        &self,
        plan_id: &str,
        project_id: &str,
        op: &PlannedOperation,
        token: &CancellationToken,
    ) -> OperationResult {
        let started_at = Utc::now();
        let fingerprint = self.fingerprint(op);

        if let Some(fp) = &fingerprint {
            if let Some(previous) = self.completed_duplicate(plan_id, project_id, op, fp) {
                info!(
                    operation_id = %op.id,
                    address = %op.address(),
                    duplicate_of = %previous.id,
                    "Skipping operation already applied"
                );
                let mut state = Self::new_state(plan_id, project_id, op, fp);
                state.status = OperationStatus::Skipped;
                state.completed_at = Some(Utc::now());
                self.record_state(state).await;
                let _ = self.idempotency.set_status(&op.id, OperationStatus::Skipped).await;

                let mut metadata = BTreeMap::new();
                metadata.insert("note".to_string(), json!("already applied"));
                metadata.insert("duplicateOf".to_string(), json!(previous.id));
                return OperationResult {
                    operation_id: op.id.clone(),
                    status: OperationStatus::Skipped,
                    resource_id: None,
                    error: None,
                    attempts: 0,
                    started_at,
                    completed_at: Utc::now(),
                    duration_ms: 0,
                    metadata,
                };
            }
        }

        let fp = fingerprint.unwrap_or_default();
        self.record_state(Self::new_state(plan_id, project_id, op, &fp)).await;

        if op.op_type() == OperationType::NoChange {
            let result = self.base.run_operation(project_id, op, token).await;
            let _ = self.idempotency.set_status(&op.id, result.status).await;
            return result;
        }

        if let Err(e) = self
            .idempotency
            .acquire_resource_ownership(op.kind(), op.name(), plan_id, &op.id)
            .await
        {
            warn!(operation_id = %op.id, error = %e, "Resource is owned by another plan");
            let message = e.to_string();
            let _ = self
                .idempotency
                .update_operation_state(&op.id, |state| {
                    state.status = OperationStatus::Failed;
                    state.completed_at = Some(Utc::now());
                    state.error_history.push(message.clone());
                })
                .await;
            return OperationResult {
                operation_id: op.id.clone(),
                status: OperationStatus::Failed,
                resource_id: None,
                error: Some(ExecutionError::new(&op.id, message, ErrorType::Conflict)),
                attempts: 0,
                started_at,
                completed_at: Utc::now(),
                duration_ms: 0,
                metadata: BTreeMap::new(),
            };
        }

        self.idempotency
            .create_checkpoint(
                &op.id,
                plan_id,
                PRE_EXECUTION,
                json!({
                    "operationType": op.op_type().to_string(),
                    "resourceKind": op.kind().as_str(),
                    "resourceName": op.name(),
                    "stage": op.stage(),
                }),
                op.operation.current.clone(),
            )
            .await;
        let _ = self.idempotency.set_status(&op.id, OperationStatus::Running).await;

        let mut result = self.base.run_operation(project_id, op, token).await;

        let error_message = result.error.as_ref().map(|e| e.message.clone());
        let status = result.status;
        let retries = result.attempts.saturating_sub(1);
        let _ = self
            .idempotency
            .update_operation_state(&op.id, |state| {
                state.status = status;
                state.retry_count = retries;
                state.completed_at = Some(Utc::now());
                if let Some(message) = &error_message {
                    state.error_history.push(message.clone());
                }
            })
            .await;

        let post_stage = if status == OperationStatus::Failed {
            POST_EXECUTION_FAILED
        } else {
            POST_EXECUTION
        };
        self.idempotency
            .create_checkpoint(
                &op.id,
                plan_id,
                post_stage,
                json!({
                    "status": status.to_string(),
                    "attempts": result.attempts,
                    "resourceId": result.resource_id,
                    "error": error_message,
                }),
                None,
            )
            .await;

        if let Err(e) = self
            .idempotency
            .release_resource_ownership(op.kind(), op.name(), plan_id)
            .await
        {
            warn!(operation_id = %op.id, error = %e, "Failed to release resource ownership");
        }

        if let (OperationStatus::Failed, Some(err)) = (result.status, result.error.clone()) {
            let recovery = self.recovery.recover_from_failure(project_id, op, &err, token).await;
            // Recovery calls the backend directly.
            self.base.invalidate(project_id, op);
            if let Ok(value) = serde_json::to_value(&recovery) {
                result.metadata.insert("recovery".to_string(), value);
            }
            if recovery.operation_completed {
                info!(operation_id = %op.id, strategy = %recovery.strategy, "Recovery completed the operation");
                result.status = OperationStatus::Completed;
                result.error = None;
                result
                    .metadata
                    .insert("note".to_string(), json!(format!("recovered by {}", recovery.strategy)));
                let _ = self.idempotency.set_status(&op.id, OperationStatus::Completed).await;
            }
            self.recoveries.insert(op.id.clone(), recovery);
        }

        result
    }
}

#[async_trait]
impl PlanExecutor for EnhancedExecutor {
    async fn execute(&self, plan: &mut Plan, token: &CancellationToken) -> Result<ExecutionResult> {
        let runner: Arc<dyn OperationRunner> = Arc::new(PlanRunner {
            executor: self.clone(),
            plan_id: plan.id.clone(),
        });
        self.base.run_plan(plan, token, runner).await
    }

    /// Outside a plan the operation id doubles as the owning plan id.
    async fn execute_operation(
        &self,
        project_id: &str,
        operation: &PlannedOperation,
        token: &CancellationToken,
    ) -> OperationResult {
        self.run_tracked(&operation.id, project_id, operation, token).await
    }

    fn cancel(&self) {
        self.base.cancel();
    }

    fn progress(&self) -> ExecutorProgress {
        self.base.progress()
    }
}
