use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::drift::{
    assess_complexity, classify_operation, drift_candidates, drift_fingerprint, DriftDetectionResult, ResourceDrift,
};
use super::rules::{evaluate, ReconcileAction};
use crate::config::types::ReconciliationConfig;
use crate::executor::engine::PlanExecutor;
use crate::executor::result::ExecutionResult;
use crate::planner::diff::DiffEngine;
use crate::planner::plan::{FieldChange, OperationStatus};
use crate::recovery::idempotency::IdempotencyManager;
use crate::state::discovery::StateDiscovery;
use crate::state::fingerprint::FingerprintEngine;
use crate::state::models::ProjectState;

/// Stage name of the checkpoint recorded for an auto-fixed drift.
pub const AUTOFIX: &str = "autofix";

/// Operator approvals for drifts whose action is prompt.
#[derive(Debug, Clone, Default)]
pub struct Approvals {
    all: bool,
    approved: HashSet<String>,
}

impl Approvals {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            all: true,
            approved: HashSet::new(),
        }
    }

    /// Approve by drift id or drift fingerprint.
    pub fn approve(mut self, id: impl Into<String>) -> Self {
        self.approved.insert(id.into());
        self
    }

    pub fn is_approved(&self, drift: &ResourceDrift) -> bool {
        self.all || self.approved.contains(&drift.id) || self.approved.contains(&drift.fingerprint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DriftOutcomeStatus {
    Fixed,
    AwaitingApproval,
    Warned,
    Manual,
    Failed,
}

impl fmt::Display for DriftOutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriftOutcomeStatus::Fixed => "fixed",
            DriftOutcomeStatus::AwaitingApproval => "awaiting approval",
            DriftOutcomeStatus::Warned => "warned",
            DriftOutcomeStatus::Manual => "manual",
            DriftOutcomeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftOutcome {
    pub drift_id: String,
    pub address: String,
    pub action: ReconcileAction,
    pub status: DriftOutcomeStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcomes: Vec<DriftOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
}

impl ReconciliationResult {
    pub fn count(&self, status: DriftOutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn outcome(&self, drift_id: &str) -> Option<&DriftOutcome> {
        self.outcomes.iter().find(|o| o.drift_id == drift_id)
    }
}

/// Drift detection and correction for one or more projects.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn detect_drift(&self, project_id: &str, desired: &ProjectState) -> Result<DriftDetectionResult>;

    async fn reconcile(
        &self,
        detection: &DriftDetectionResult,
        approvals: &Approvals,
        token: &CancellationToken,
    ) -> Result<ReconciliationResult>;
}

/// Occurrence history of a drift fingerprint.
#[derive(Debug, Clone, Copy)]
struct Sighting {
    first_seen: DateTime<Utc>,
    occurrences: u32,
}

pub struct ReconciliationManager {
    discovery: Arc<dyn StateDiscovery>,
    diff: DiffEngine,
    fingerprints: FingerprintEngine,
    idempotency: Arc<IdempotencyManager>,
    config: ReconciliationConfig,
    executor: Option<Arc<dyn PlanExecutor>>,
    sightings: DashMap<String, Sighting>,
}

impl ReconciliationManager {
    pub fn new(
        discovery: Arc<dyn StateDiscovery>,
        diff: DiffEngine,
        fingerprints: FingerprintEngine,
        idempotency: Arc<IdempotencyManager>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            discovery,
            diff,
            fingerprints,
            idempotency,
            config,
            executor: None,
            sightings: DashMap::new(),
        }
    }

    /// Executor used to apply fixes when `applyFixes` is enabled.
    pub fn with_executor(mut self, executor: Arc<dyn PlanExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    fn sight(&self, key: &str, now: DateTime<Utc>) -> Sighting {
        let mut entry = self.sightings.entry(key.to_string()).or_insert(Sighting {
            first_seen: now,
            occurrences: 0,
        });
        entry.occurrences += 1;
        *entry
    }

    /// Forget drifts that were not seen in the latest detection of a project.
    fn retain_sightings(&self, seen: &HashSet<String>, previous: &HashSet<String>) {
        for key in previous.difference(seen) {
            self.sightings.remove(key);
        }
    }

    /// Record the intended changes of a drift and checkpoint them.
    async fn record_fix(&self, plan_id: &str, drift: &ResourceDrift) -> DriftOutcome {
        let checkpoint = self
            .idempotency
            .create_checkpoint(
                &drift.id,
                plan_id,
                AUTOFIX,
                json!({
                    "resourceKind": drift.resource_kind.as_str(),
                    "resourceName": drift.resource_name,
                    "driftType": drift.drift_type,
                    "fingerprint": drift.fingerprint,
                    "fieldChanges": drift.field_changes,
                }),
                drift.operation.current.clone(),
            )
            .await;
        info!(
            address = %drift.address(),
            drift_type = %drift.drift_type,
            changes = drift.field_changes.len(),
            "Recorded drift fix"
        );
        DriftOutcome {
            drift_id: drift.id.clone(),
            address: drift.address(),
            action: drift.action,
            status: DriftOutcomeStatus::Fixed,
            field_changes: drift.field_changes.clone(),
            checkpoint_id: Some(checkpoint.id),
            message: format!("{} change(s) recorded", drift.field_changes.len()),
        }
    }

    /// Apply fixed drifts through the executor and downgrade the ones whose
    /// operations did not complete.
    async fn apply_fixes(
        &self,
        executor: &Arc<dyn PlanExecutor>,
        detection: &DriftDetectionResult,
        fixed: &[&ResourceDrift],
        outcomes: &mut [DriftOutcome],
        token: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let mut operations = Vec::new();
        for drift in fixed {
            if let Some(companion) = &drift.companion {
                operations.push(companion.clone());
            }
            operations.push(drift.operation.clone());
        }
        let mut plan = self
            .diff
            .stage_plan(&detection.project_id, operations)
            .context("Failed to stage drift fixes")?;
        let result = executor
            .execute(&mut plan, token)
            .await
            .context("Failed to execute drift fixes")?;

        for planned in &plan.operations {
            if matches!(planned.status, OperationStatus::Completed | OperationStatus::Skipped) {
                continue;
            }
            let address = planned.address();
            let error = result
                .result(&planned.id)
                .and_then(|r| r.error.as_ref())
                .map(|e| e.message.clone())
                .unwrap_or_else(|| format!("{} not applied", address));
            if let Some(outcome) = outcomes.iter_mut().find(|o| o.address == address) {
                outcome.status = DriftOutcomeStatus::Failed;
                outcome.message = error;
            }
        }
        Ok(result)
    }

    /// Detect and reconcile on a fixed interval until `token` is cancelled.
    /// Prompted drifts are never approved by the schedule.
    pub fn schedule_reconciliation(
        self: &Arc<Self>,
        project_id: String,
        desired: ProjectState,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = self.config.schedule_interval();
        tokio::spawn(async move {
            info!(project_id = %project_id, interval_secs = interval.as_secs(), "Scheduled reconciliation started");
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match manager.detect_drift(&project_id, &desired).await {
                    Ok(detection) if detection.has_drift() => {
                        match manager.reconcile(&detection, &Approvals::none(), &token).await {
                            Ok(result) => info!(
                                project_id = %project_id,
                                fixed = result.count(DriftOutcomeStatus::Fixed),
                                pending = result.count(DriftOutcomeStatus::AwaitingApproval),
                                "Scheduled reconciliation pass finished"
                            ),
                            Err(e) => error!(project_id = %project_id, error = %e, "Scheduled reconciliation failed"),
                        }
                    }
                    Ok(_) => debug!(project_id = %project_id, "No drift detected"),
                    Err(e) => error!(project_id = %project_id, error = %e, "Drift detection failed"),
                }
            }
            info!(project_id = %project_id, "Scheduled reconciliation stopped");
        })
    }
}

#[async_trait]
impl Reconciler for ReconciliationManager {
    async fn detect_drift(&self, project_id: &str, desired: &ProjectState) -> Result<DriftDetectionResult> {
        let current = self
            .discovery
            .discover_project(project_id)
            .await
            .with_context(|| format!("Failed to discover project {}", project_id))?;
        let plan = self
            .diff
            .compute_plan(desired, &current)
            .context("Failed to diff desired and current state")?;

        let now = Utc::now();
        let scope = format!("{}/", project_id);
        let previous: HashSet<String> = self
            .sightings
            .iter()
            .filter(|e| e.key().starts_with(&scope))
            .map(|e| e.key().clone())
            .collect();
        let mut seen = HashSet::new();
        let mut drifts = Vec::new();

        for (operation, companion) in drift_candidates(&plan) {
            let drift_type = classify_operation(&operation);
            let complexity = assess_complexity(&operation, drift_type);
            let fingerprint = drift_fingerprint(&self.fingerprints, &operation, drift_type);
            let key = format!("{}{}", scope, fingerprint);
            let sighting = self.sight(&key, now);
            seen.insert(key);

            let mut drift = ResourceDrift {
                id: uuid::Uuid::new_v4().to_string(),
                resource_kind: operation.resource_kind,
                resource_name: operation.resource_name.clone(),
                drift_type,
                severity: operation.impact.risk_level,
                complexity,
                field_changes: operation.field_changes.clone(),
                operation,
                companion,
                auto_fix: false,
                action: ReconcileAction::Warn,
                rule: None,
                fingerprint,
                detected_at: now,
                first_seen: sighting.first_seen,
                occurrences: sighting.occurrences,
            };
            let (action, rule) = evaluate(&self.config.rules, self.config.default_action, &drift);
            drift.action = action;
            drift.auto_fix = action == ReconcileAction::AutoFix;
            drift.rule = rule;
            if drift.occurrences > 1 {
                debug!(
                    address = %drift.address(),
                    occurrences = drift.occurrences,
                    "Drift seen before"
                );
            }
            drifts.push(drift);
        }
        self.retain_sightings(&seen, &previous);

        info!(project_id, drifts = drifts.len(), "Drift detection finished");
        Ok(DriftDetectionResult {
            project_id: project_id.to_string(),
            detected_at: now,
            drifts,
            plan,
            current_fingerprint: current.fingerprint,
        })
    }

    async fn reconcile(
        &self,
        detection: &DriftDetectionResult,
        approvals: &Approvals,
        token: &CancellationToken,
    ) -> Result<ReconciliationResult> {
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(detection.drifts.len());
        let mut fixed = Vec::new();

        for drift in &detection.drifts {
            if token.is_cancelled() {
                warn!("Reconciliation cancelled");
                break;
            }
            let fix = match drift.action {
                ReconcileAction::AutoFix => true,
                ReconcileAction::Prompt => approvals.is_approved(drift),
                ReconcileAction::Warn | ReconcileAction::Manual => false,
            };
            if fix {
                outcomes.push(self.record_fix(&detection.plan.id, drift).await);
                fixed.push(drift);
                continue;
            }

            let (status, message) = match drift.action {
                ReconcileAction::Prompt => (
                    DriftOutcomeStatus::AwaitingApproval,
                    format!("{} drift needs approval", drift.drift_type),
                ),
                ReconcileAction::Manual => (
                    DriftOutcomeStatus::Manual,
                    format!("{} drift must be resolved by hand", drift.drift_type),
                ),
                _ => {
                    warn!(address = %drift.address(), drift_type = %drift.drift_type, "Drift detected");
                    (DriftOutcomeStatus::Warned, format!("{} drift reported", drift.drift_type))
                }
            };
            outcomes.push(DriftOutcome {
                drift_id: drift.id.clone(),
                address: drift.address(),
                action: drift.action,
                status,
                field_changes: Vec::new(),
                checkpoint_id: None,
                message,
            });
        }

        let execution = match (&self.executor, self.config.apply_fixes && !fixed.is_empty()) {
            (Some(executor), true) => Some(
                self.apply_fixes(executor, detection, &fixed, &mut outcomes, token)
                    .await?,
            ),
            _ => None,
        };

        Ok(ReconciliationResult {
            project_id: detection.project_id.clone(),
            started_at,
            completed_at: Utc::now(),
            outcomes,
            execution,
        })
    }
}
