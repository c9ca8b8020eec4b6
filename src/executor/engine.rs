use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::progress::{ExecutorProgress, ProgressTracker};
use super::result::{ErrorType, ExecutionError, ExecutionResult, ExecutionSummary, OperationResult};
use super::retry::RetryManager;
use crate::config::types::{EngineConfig, ExecutorConfig};
use crate::planner::plan::{OperationStatus, OperationType, Plan, PlanStatus, PlannedOperation, RiskLevel};
use crate::provider::registry::HandlerRegistry;
use crate::provider::service::ServiceError;
use crate::state::cache::StateCache;

/// Runs a single planned operation to a terminal result.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn run(&self, project_id: &str, operation: &PlannedOperation, token: &CancellationToken) -> OperationResult;
}

/// Executes whole plans.
#[async_trait]
pub trait PlanExecutor: Send + Sync {
    /// Run every stage of `plan`, updating its operation statuses in place.
    async fn execute(&self, plan: &mut Plan, token: &CancellationToken) -> Result<ExecutionResult>;

    async fn execute_operation(
        &self,
        project_id: &str,
        operation: &PlannedOperation,
        token: &CancellationToken,
    ) -> OperationResult;

    /// Stop dispatching at the next stage or operation boundary.
    fn cancel(&self);

    fn progress(&self) -> ExecutorProgress;
}

/// Stage-by-stage plan executor with bounded parallelism.
///
/// `cancel` stops the plans running at the time of the call. Plans started
/// afterwards run normally.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    retry: RetryManager,
    progress: Arc<ProgressTracker>,
    cache: Option<StateCache>,
    /// Per-plan tokens of the plans currently running.
    running: Arc<DashMap<String, CancellationToken>>,
}

/// Accumulated outcome while walking a plan.
#[derive(Default)]
struct RunState {
    results: BTreeMap<String, OperationResult>,
    errors: Vec<ExecutionError>,
    failed: HashSet<String>,
    fatal: bool,
}

impl Executor {
    pub fn new(registry: Arc<HandlerRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            config: config.executor.clone(),
            retry: RetryManager::new(config.retry.clone(), config.executor.preserve_existing),
            progress: Arc::new(ProgressTracker::new(&config.progress)),
            cache: None,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Invalidate entries of this cache after every dispatched mutation.
    pub fn with_cache(mut self, cache: StateCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Drop the cached state of the project `op` touches.
    pub fn invalidate(&self, project_id: &str, op: &PlannedOperation) {
        if let Some(cache) = &self.cache {
            cache.invalidate_by_resource(project_id, op.kind(), op.name());
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Whether the plan keeps going after `err`. Returning false stops the
    /// current stage once in-flight work drains and skips later stages.
    pub fn should_continue_on_error(&self, operation: &PlannedOperation, err: &ExecutionError) -> bool {
        match err.error_type {
            ErrorType::Authentication | ErrorType::Validation => false,
            ErrorType::Network | ErrorType::Timeout => true,
            ErrorType::Conflict
                if operation.op_type() == OperationType::Create && self.config.preserve_existing =>
            {
                true
            }
            t if operation.impact().risk_level == RiskLevel::Critical && t != ErrorType::Conflict => false,
            _ => true,
        }
    }

    // ─── Plan Execution ─────────────────────────────────────────────────────

    /// Walk the plan stage by stage, running each operation through `runner`.
    pub async fn run_plan(
        &self,
        plan: &mut Plan,
        token: &CancellationToken,
        runner: Arc<dyn OperationRunner>,
    ) -> Result<ExecutionResult> {
        let started_at = Utc::now();
        let clock = Instant::now();
        plan.status = PlanStatus::Executing;
        self.progress.begin(plan);

        let plan_id = plan.id.clone();
        let project_id = plan.project_id.clone();
        let scoped = token.child_token();
        self.running.insert(plan_id.clone(), scoped.clone());
        let token = &scoped;
        info!(
            plan_id = %plan_id,
            project_id = %project_id,
            operations = plan.operations.len(),
            stages = plan.max_stage + 1,
            "Executing plan"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_operations.max(1)));
        let mut run = RunState::default();
        let mut cancelled = false;

        for stage in 0..=plan.max_stage {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            self.progress.set_stage(stage);

            let ops: Vec<PlannedOperation> = plan.stage_operations(stage).cloned().collect();
            if ops.is_empty() {
                continue;
            }
            debug!(plan_id = %plan_id, stage, operations = ops.len(), "Starting stage");

            let (blocked, ready): (Vec<_>, Vec<_>) = ops
                .into_iter()
                .partition(|op| op.depends_on.iter().any(|dep| run.failed.contains(dep)));
            for op in blocked {
                let result = self.dependency_failure(&op, &run.failed);
                self.absorb(&mut run, &op, result);
            }

            let (parallel, sequential): (Vec<_>, Vec<_>) = ready
                .into_iter()
                .partition(|op| self.config.is_parallel_safe(op.kind()));

            let mut handles = Vec::with_capacity(parallel.len());
            for op in parallel {
                let runner = Arc::clone(&runner);
                let semaphore = Arc::clone(&semaphore);
                let token = token.clone();
                let project_id = project_id.clone();
                let task_op = op.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    runner.run(&project_id, &task_op, &token).await
                });
                handles.push((op, handle));
            }
            // Drain every worker even after a fatal error.
            for (op, handle) in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => failed_result(
                        &op,
                        ExecutionError::new(&op.id, format!("worker for {} aborted: {}", op.address(), e), ErrorType::Internal),
                        0,
                        Utc::now(),
                        Instant::now(),
                    ),
                };
                self.absorb(&mut run, &op, result);
            }

            for op in sequential {
                if run.fatal || token.is_cancelled() {
                    break;
                }
                let result = runner.run(&project_id, &op, token).await;
                self.absorb(&mut run, &op, result);
            }

            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            if run.fatal {
                warn!(plan_id = %plan_id, stage, "Fatal error, skipping remaining operations");
                break;
            }
        }

        self.running.remove(&plan_id);
        for op in &mut plan.operations {
            if let Some(result) = run.results.get(&op.id) {
                op.status = result.status;
            }
        }

        let mut summary = ExecutionSummary {
            total: plan.operations.len(),
            ..Default::default()
        };
        for result in run.results.values() {
            match result.status {
                OperationStatus::Completed => summary.completed += 1,
                OperationStatus::Skipped => {
                    summary.completed += 1;
                    summary.skipped += 1;
                }
                OperationStatus::Failed => summary.failed += 1,
                _ => {}
            }
            if result.retried() {
                summary.retried += 1;
            }
        }
        summary.pending = summary.total.saturating_sub(run.results.len());

        let status = if cancelled {
            PlanStatus::Cancelled
        } else if summary.failed > 0 || summary.pending > 0 {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        };

        let completed_at = Utc::now();
        plan.status = status;
        plan.completed_at = Some(completed_at);
        plan.last_error = run.errors.last().map(|e| e.to_string());
        self.progress.finish(status);

        info!(
            plan_id = %plan_id,
            status = %status,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "Plan finished"
        );

        Ok(ExecutionResult {
            plan_id,
            status,
            started_at,
            completed_at,
            operation_results: run.results,
            errors: run.errors,
            summary,
        })
    }

    fn absorb(&self, run: &mut RunState, op: &PlannedOperation, result: OperationResult) {
        self.progress.update(&op.id, result.status);
        if result.status == OperationStatus::Failed {
            run.failed.insert(op.id.clone());
            if let Some(err) = &result.error {
                self.progress.record_error(&op.id, &err.message);
                run.errors.push(err.clone());
                if !self.should_continue_on_error(op, err) {
                    error!(
                        operation_id = %op.id,
                        resource_kind = %op.kind(),
                        resource_name = op.name(),
                        error_type = %err.error_type,
                        "Operation failed fatally"
                    );
                    run.fatal = true;
                }
            }
        }
        run.results.insert(op.id.clone(), result);
    }

    fn dependency_failure(&self, op: &PlannedOperation, failed: &HashSet<String>) -> OperationResult {
        let deps: Vec<&str> = op
            .depends_on
            .iter()
            .filter(|dep| failed.contains(*dep))
            .map(String::as_str)
            .collect();
        warn!(operation_id = %op.id, address = %op.address(), "Dependency failed, not dispatching");
        failed_result(
            op,
            ExecutionError::new(
                &op.id,
                format!("{} depends on failed operations: {}", op.address(), deps.join(", ")),
                ErrorType::Dependency,
            ),
            0,
            Utc::now(),
            Instant::now(),
        )
    }

    // ─── Single Operation ───────────────────────────────────────────────────

    /// Dispatch one operation with retry and timeout, mapping backend outcomes
    /// onto an operation result.
    pub async fn run_operation(
        &self,
        project_id: &str,
        op: &PlannedOperation,
        token: &CancellationToken,
    ) -> OperationResult {
        let started_at = Utc::now();
        let clock = Instant::now();

        if op.op_type() == OperationType::NoChange {
            return finished(op, OperationStatus::Completed, 0, started_at, clock);
        }
        if token.is_cancelled() {
            return failed_result(
                op,
                ExecutionError::new(&op.id, format!("{} cancelled before dispatch", op.address()), ErrorType::Internal),
                0,
                started_at,
                clock,
            );
        }

        self.progress.update(&op.id, OperationStatus::Running);
        debug!(operation_id = %op.id, address = %op.address(), op_type = %op.op_type(), "Dispatching operation");

        let attempts = AtomicU32::new(0);
        let registry: &HandlerRegistry = &self.registry;
        let progress: &ProgressTracker = &self.progress;
        let address = op.address();
        let call = self.retry.execute_with_retry(
            op.kind(),
            &address,
            token,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                registry.dispatch(project_id, &op.operation)
            },
            |attempt, err, delay| {
                progress.update(&op.id, OperationStatus::Retrying);
                debug!(
                    operation_id = %op.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation will be retried"
                );
            },
        );

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ServiceError::Cancelled),
            timed = tokio::time::timeout(self.config.operation_timeout(), call) => match timed {
                Ok(outcome) => outcome.result,
                Err(_) => Err(ServiceError::Timeout(format!(
                    "{} did not finish within {}s",
                    address, self.config.operation_timeout_secs
                ))),
            },
        };
        let attempts = attempts.load(Ordering::SeqCst);

        // A failed call may still have changed the backend.
        if attempts > 0 {
            self.invalidate(project_id, op);
        }

        let result = match outcome {
            Ok(response) => {
                let mut result = finished(op, OperationStatus::Completed, attempts, started_at, clock);
                result.resource_id = response.id;
                result.metadata.extend(response.metadata);
                result
            }
            Err(err) if op.op_type() == OperationType::Delete && err.is_not_found() => {
                finished(op, OperationStatus::Completed, attempts, started_at, clock).with_note("already deleted")
            }
            Err(err)
                if op.op_type() == OperationType::Create
                    && err.is_conflict()
                    && self.config.preserve_existing =>
            {
                finished(op, OperationStatus::Completed, attempts, started_at, clock).with_note("preserved")
            }
            Err(err) => {
                let error_type = ErrorType::from(&err);
                warn!(
                    operation_id = %op.id,
                    address = %address,
                    attempts,
                    error_type = %error_type,
                    error = %err,
                    "Operation failed"
                );
                return failed_result(
                    op,
                    ExecutionError::new(&op.id, format!("{} {}: {}", op.op_type(), address, err), error_type),
                    attempts,
                    started_at,
                    clock,
                );
            }
        };

        debug!(operation_id = %op.id, address = %address, attempts, "Operation completed");
        result
    }
}

fn finished(
    op: &PlannedOperation,
    status: OperationStatus,
    attempts: u32,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
) -> OperationResult {
    OperationResult {
        operation_id: op.id.clone(),
        status,
        resource_id: None,
        error: None,
        attempts,
        started_at,
        completed_at: Utc::now(),
        duration_ms: clock.elapsed().as_millis() as u64,
        metadata: BTreeMap::new(),
    }
}

fn failed_result(
    op: &PlannedOperation,
    error: ExecutionError,
    attempts: u32,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
) -> OperationResult {
    let mut result = finished(op, OperationStatus::Failed, attempts, started_at, clock);
    result.error = Some(error);
    result
}

#[async_trait]
impl OperationRunner for Executor {
    async fn run(&self, project_id: &str, operation: &PlannedOperation, token: &CancellationToken) -> OperationResult {
        self.run_operation(project_id, operation, token).await
    }
}

#[async_trait]
impl PlanExecutor for Executor {
    async fn execute(&self, plan: &mut Plan, token: &CancellationToken) -> Result<ExecutionResult> {
        let runner: Arc<dyn OperationRunner> = Arc::new(self.clone());
        self.run_plan(plan, token, runner).await
    }

    async fn execute_operation(
        &self,
        project_id: &str,
        operation: &PlannedOperation,
        token: &CancellationToken,
    ) -> OperationResult {
        self.run_operation(project_id, operation, token).await
    }

    fn cancel(&self) {
        info!(plans = self.running.len(), "Executor cancellation requested");
        for entry in self.running.iter() {
            entry.value().cancel();
        }
    }

    fn progress(&self) -> ExecutorProgress {
        self.progress.snapshot()
    }
}
