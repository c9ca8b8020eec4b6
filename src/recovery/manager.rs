use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classify::classify_execution_error;
use super::idempotency::IdempotencyManager;
use crate::config::types::RecoveryConfig;
use crate::executor::result::{ErrorType, ExecutionError};
use crate::planner::plan::{Operation, OperationStatus, OperationType, PlannedOperation, RiskLevel};
use crate::provider::registry::HandlerRegistry;
use crate::provider::service::ServiceError;
use crate::state::models::{Resource, ResourceKind};

/// Stage name of the checkpoint written before a mutation.
pub const PRE_EXECUTION: &str = "pre-execution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Retry,
    Skip,
    Rollback,
    Abort,
    Manual,
    Cleanup,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Rollback => "rollback",
            RecoveryStrategy::Abort => "abort",
            RecoveryStrategy::Manual => "manual",
            RecoveryStrategy::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// Built-in strategy for an operation type and failure type.
pub fn default_strategy(op_type: OperationType, failure: ErrorType) -> RecoveryStrategy {
    use ErrorType::*;
    use RecoveryStrategy as S;

    match (op_type, failure) {
        (_, Dependency) => S::Manual,
        (OperationType::Create, Network | Timeout | Internal) => S::Rollback,
        (OperationType::Create, Conflict) => S::Skip,
        (OperationType::Create, ResourceState) => S::Cleanup,
        (OperationType::Create, Validation | Authentication | Quota) => S::Abort,
        (OperationType::Update, Network | Timeout | Conflict) => S::Retry,
        (OperationType::Update, ResourceState) => S::Rollback,
        (OperationType::Update, Validation | Authentication | Quota) => S::Abort,
        (OperationType::Delete, Network | Timeout) => S::Retry,
        (OperationType::Delete, ResourceState) => S::Skip,
        (OperationType::Delete, Authentication) => S::Abort,
        _ => S::Manual,
    }
}

// ─── Results ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub action: String,
    pub description: String,
    /// 0.0 to 1.0.
    pub confidence: f64,
    /// Numbered steps, "1. ...".
    pub next_actions: Vec<String>,
}

/// A resource touched by a failure, with what its recorded state says about
/// recovering it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OperationStatus>,
    pub impact: RiskLevel,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub operation_id: String,
    pub success: bool,
    pub strategy: RecoveryStrategy,
    pub failure_type: ErrorType,
    pub rollback_performed: bool,
    pub cleanup_performed: bool,
    /// The original operation eventually succeeded.
    pub operation_completed: bool,
    pub resources_cleaned: Vec<String>,
    pub affected_resources: Vec<AffectedResource>,
    pub recommendations: Vec<Recommendation>,
    pub message: String,
    pub duration_ms: u64,
}

impl RecoveryResult {
    fn new(operation_id: &str, strategy: RecoveryStrategy, failure_type: ErrorType) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            success: false,
            strategy,
            failure_type,
            rollback_performed: false,
            cleanup_performed: false,
            operation_completed: false,
            resources_cleaned: Vec::new(),
            affected_resources: Vec::new(),
            recommendations: Vec::new(),
            message: String::new(),
            duration_ms: 0,
        }
    }
}

// ─── Manager ────────────────────────────────────────────────────────────────

/// Decides and carries out what to do after an operation failed.
pub struct RecoveryManager {
    registry: Arc<HandlerRegistry>,
    idempotency: Arc<IdempotencyManager>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(registry: Arc<HandlerRegistry>, idempotency: Arc<IdempotencyManager>, config: RecoveryConfig) -> Self {
        Self {
            registry,
            idempotency,
            config,
        }
    }

    /// Configured override first, then the built-in table. Disabled rollback
    /// or cleanup falls back to manual intervention.
    pub fn select_strategy(&self, op_type: OperationType, failure: ErrorType) -> RecoveryStrategy {
        let strategy = self
            .config
            .operation_strategies
            .get(&op_type)
            .copied()
            .unwrap_or_else(|| default_strategy(op_type, failure));
        match strategy {
            RecoveryStrategy::Rollback if !self.config.enable_rollback => RecoveryStrategy::Manual,
            RecoveryStrategy::Cleanup if !self.config.enable_cleanup => RecoveryStrategy::Manual,
            s => s,
        }
    }

    pub async fn recover_from_failure(
        &self,
        project_id: &str,
        op: &PlannedOperation,
        err: &ExecutionError,
        token: &CancellationToken,
    ) -> RecoveryResult {
        let clock = Instant::now();
        let failure = classify_execution_error(err);
        let strategy = self.select_strategy(op.op_type(), failure);
        info!(
            operation_id = %op.id,
            address = %op.address(),
            failure_type = %failure,
            strategy = %strategy,
            "Recovering from failed operation"
        );

        let mut result = RecoveryResult::new(&op.id, strategy, failure);
        match strategy {
            RecoveryStrategy::Retry => self.retry(project_id, op, token, &mut result).await,
            RecoveryStrategy::Rollback => self.rollback(project_id, op, &mut result).await,
            RecoveryStrategy::Cleanup => self.cleanup(project_id, op, &mut result).await,
            RecoveryStrategy::Skip => {
                result.success = true;
                result.message = format!("{} left as is after {} failure", op.address(), failure);
            }
            RecoveryStrategy::Abort => {
                result.message = format!("{} failure on {} cannot be recovered automatically", failure, op.address());
            }
            RecoveryStrategy::Manual => {
                result.message = format!("{} needs manual intervention", op.address());
            }
        }

        result.affected_resources = self.affected_resources(project_id, op, failure);
        result.recommendations = recommendations(op, &result);
        result.duration_ms = clock.elapsed().as_millis() as u64;
        debug!(
            operation_id = %op.id,
            strategy = %result.strategy,
            success = result.success,
            "Recovery finished"
        );
        result
    }

    // ─── Strategies ─────────────────────────────────────────────────────────

    async fn retry(&self, project_id: &str, op: &PlannedOperation, token: &CancellationToken, result: &mut RecoveryResult) {
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let attempts = self.config.max_recovery_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    result.message = "recovery cancelled".to_string();
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            match self.registry.dispatch(project_id, &op.operation).await {
                Ok(_) => {
                    result.success = true;
                    result.operation_completed = true;
                    result.message = format!("{} succeeded on recovery attempt {}", op.address(), attempt);
                    return;
                }
                Err(e) if op.op_type() == OperationType::Delete && e.is_not_found() => {
                    result.success = true;
                    result.operation_completed = true;
                    result.message = format!("{} already deleted", op.address());
                    return;
                }
                Err(e) => {
                    warn!(operation_id = %op.id, attempt, error = %e, "Recovery retry failed");
                    last_error = e.to_string();
                }
            }
        }
        result.message = format!("{} still failing after {} recovery attempts: {}", op.address(), attempts, last_error);
    }

    async fn rollback(&self, project_id: &str, op: &PlannedOperation, result: &mut RecoveryResult) {
        match op.op_type() {
            OperationType::Create => {
                self.remove_partial(project_id, op, result).await;
                result.rollback_performed = result.success;
            }
            OperationType::Update | OperationType::Delete => {
                let previous = self
                    .idempotency
                    .get_checkpoint(&op.id, PRE_EXECUTION)
                    .and_then(|cp| cp.resource_state);
                let Some(previous) = previous else {
                    result.strategy = RecoveryStrategy::Manual;
                    result.message = format!("no checkpoint with the previous state of {}; rollback needs manual intervention", op.address());
                    return;
                };
                self.restore_previous(project_id, op, previous, result).await;
            }
            OperationType::NoChange => {
                result.success = true;
                result.message = "nothing to roll back".to_string();
            }
        }
    }

    async fn cleanup(&self, project_id: &str, op: &PlannedOperation, result: &mut RecoveryResult) {
        if op.op_type() != OperationType::Create {
            result.strategy = RecoveryStrategy::Manual;
            result.message = format!("{} is in an inconsistent state; cleanup needs manual intervention", op.address());
            return;
        }
        self.remove_partial(project_id, op, result).await;
        result.cleanup_performed = result.success;
    }

    /// Delete whatever a failed create may have left behind.
    async fn remove_partial(&self, project_id: &str, op: &PlannedOperation, result: &mut RecoveryResult) {
        let Some(desired) = op.operation.desired.as_ref() else {
            result.message = format!("{} carries no desired resource to remove", op.address());
            return;
        };
        let outcome = match self.registry.service(op.kind()) {
            Ok(service) => service.delete(project_id, desired).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                result.success = true;
                result.message = format!("removed partially created {}", op.address());
            }
            Err(ServiceError::NotFound { .. }) => {
                result.success = true;
                result.message = format!("{} was never created", op.address());
            }
            Err(e) => {
                warn!(operation_id = %op.id, error = %e, "Failed to remove partially created resource");
                result.message = format!("could not remove {}: {}", op.address(), e);
                return;
            }
        }
        result.resources_cleaned.push(op.name().to_string());
    }

    /// Put the resource back the way the pre-execution checkpoint saw it.
    async fn restore_previous(&self, project_id: &str, op: &PlannedOperation, previous: Resource, result: &mut RecoveryResult) {
        let op_type = match op.op_type() {
            OperationType::Delete => OperationType::Create,
            _ => OperationType::Update,
        };
        let restore = Operation {
            op_type,
            resource_kind: op.kind(),
            resource_name: op.name().to_string(),
            current: op.operation.desired.clone(),
            desired: Some(previous),
            field_changes: Vec::new(),
            impact: op.impact().clone(),
            stage: op.stage(),
        };
        match self.registry.dispatch(project_id, &restore).await {
            Ok(_) => {
                result.success = true;
                result.rollback_performed = true;
                result.message = format!("restored previous state of {}", op.address());
            }
            Err(e) if op_type == OperationType::Create && e.is_conflict() => {
                result.success = true;
                result.rollback_performed = true;
                result.message = format!("{} still exists; nothing to restore", op.address());
            }
            Err(e) => {
                warn!(operation_id = %op.id, error = %e, "Rollback failed");
                result.message = format!("rollback of {} failed: {}", op.address(), e);
            }
        }
    }

    // ─── Analysis ───────────────────────────────────────────────────────────

    /// The failed resource plus related resources recorded for the same
    /// project.
    fn affected_resources(&self, project_id: &str, op: &PlannedOperation, failure: ErrorType) -> Vec<AffectedResource> {
        let related: &[ResourceKind] = match op.kind() {
            ResourceKind::Cluster => &[ResourceKind::DatabaseUser, ResourceKind::NetworkAccess],
            ResourceKind::DatabaseUser | ResourceKind::NetworkAccess => &[ResourceKind::Cluster],
            _ => &[],
        };

        let primary_state = self.idempotency.get_operation_state(&op.id).map(|s| s.status);
        let mut affected = vec![AffectedResource {
            kind: op.kind(),
            name: op.name().to_string(),
            primary: true,
            state: primary_state,
            impact: op.impact().risk_level,
            recoverable: failure.is_recoverable(),
        }];

        let mut seen = BTreeSet::new();
        // Newest state per resource wins.
        let mut states = self.idempotency.states_for_project(project_id);
        states.reverse();
        for state in states {
            if !related.contains(&state.resource_kind) || !seen.insert((state.resource_kind, state.resource_id.clone())) {
                continue;
            }
            let impact = match state.status {
                OperationStatus::Failed => RiskLevel::High,
                OperationStatus::Running | OperationStatus::Retrying | OperationStatus::Pending => RiskLevel::Medium,
                OperationStatus::Completed | OperationStatus::Skipped => RiskLevel::Low,
            };
            affected.push(AffectedResource {
                kind: state.resource_kind,
                name: state.resource_id,
                primary: false,
                state: Some(state.status),
                impact,
                recoverable: state.status != OperationStatus::Failed
                    || state.retry_count < self.config.max_recovery_attempts.max(1),
            });
        }
        affected
    }
}

fn numbered(steps: &[String]) -> Vec<String> {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step))
        .collect()
}

fn recommendations(op: &PlannedOperation, result: &RecoveryResult) -> Vec<Recommendation> {
    let address = op.address();
    let (action, description, confidence, steps) = match (result.strategy, result.success) {
        (_, true) if result.operation_completed => (
            "none",
            format!("{} completed during recovery", address),
            0.9,
            vec![format!("Run a plan to confirm {} matches the desired state", address)],
        ),
        (RecoveryStrategy::Rollback | RecoveryStrategy::Cleanup, true) => (
            "reapply",
            format!("{} was returned to its previous state", address),
            0.8,
            vec![
                format!("Investigate the {} failure", result.failure_type),
                "Re-run apply once the cause is resolved".to_string(),
            ],
        ),
        (RecoveryStrategy::Skip, true) => (
            "verify",
            format!("{} was left in place", address),
            0.7,
            vec![
                format!("Inspect {} in the control plane", address),
                "Run a plan to check for remaining drift".to_string(),
            ],
        ),
        (RecoveryStrategy::Abort, _) => (
            "fix-input",
            format!("{} failed with a {} error that retries cannot fix", address, result.failure_type),
            0.9,
            vec![
                "Correct the manifest or credentials".to_string(),
                "Run validate, then apply again".to_string(),
            ],
        ),
        (RecoveryStrategy::Retry, false) => (
            "retry-later",
            format!("{} kept failing with {} errors", address, result.failure_type),
            0.6,
            vec![
                "Check control-plane availability".to_string(),
                "Re-run apply; completed operations are skipped".to_string(),
            ],
        ),
        _ => (
            "manual",
            result.message.clone(),
            0.5,
            vec![
                format!("Inspect {} and its dependents in the control plane", address),
                "Repair or remove the resource by hand".to_string(),
                "Run a plan to confirm the project converges".to_string(),
            ],
        ),
    };
    vec![Recommendation {
        action: action.to_string(),
        description,
        confidence,
        next_actions: numbered(&steps),
    }]
}
