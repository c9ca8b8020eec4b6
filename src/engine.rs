use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::manifest::{desired_state, ApplyDocument};
use crate::config::types::EngineConfig;
use crate::config::validator::{ValidationReport, Validator};
use crate::executor::enhanced::EnhancedExecutor;
use crate::executor::engine::PlanExecutor;
use crate::executor::progress::ProgressEvent;
use crate::executor::result::ExecutionResult;
use crate::planner::diff::DiffEngine;
use crate::planner::plan::Plan;
use crate::provider::registry::HandlerRegistry;
use crate::reconcile::drift::DriftDetectionResult;
use crate::reconcile::manager::{Approvals, ReconciliationManager, ReconciliationResult, Reconciler};
use crate::recovery::idempotency::IdempotencyManager;
use crate::state::backend::IdempotencyStore;
use crate::state::cache::StateCache;
use crate::state::discovery::{CachedStateDiscovery, ControlPlaneDiscovery, StateDiscovery};
use crate::state::fingerprint::FingerprintEngine;
use crate::state::models::ProjectState;

/// Validate → discover → plan → apply, plus destroy and drift, over one
/// control plane.
pub struct Engine {
    config: EngineConfig,
    cache: StateCache,
    discovery: Arc<dyn StateDiscovery>,
    diff: DiffEngine,
    idempotency: Arc<IdempotencyManager>,
    executor: EnhancedExecutor,
    reconciler: Arc<ReconciliationManager>,
    validator: Validator,
}

impl Engine {
    pub fn new(registry: HandlerRegistry, config: EngineConfig) -> Self {
        Self::build(registry, config, |cfg| IdempotencyManager::new(cfg.idempotency.clone()))
    }

    /// Build an engine whose idempotency records persist in `store`, and
    /// restore what the store already holds.
    pub async fn with_idempotency_store(
        registry: HandlerRegistry,
        config: EngineConfig,
        store: Arc<dyn IdempotencyStore>,
    ) -> Result<Self> {
        let engine = Self::build(registry, config, |cfg| {
            IdempotencyManager::new(cfg.idempotency.clone()).with_store(store)
        });
        engine
            .idempotency
            .restore()
            .await
            .context("Failed to restore idempotency records")?;
        Ok(engine)
    }

    fn build<F>(registry: HandlerRegistry, config: EngineConfig, idempotency: F) -> Self
    where
        F: FnOnce(&EngineConfig) -> IdempotencyManager,
    {
        let registry = Arc::new(registry);
        let fingerprints = FingerprintEngine::new(&config.fingerprint);
        let cache = StateCache::new(&config.cache);
        let live: Arc<dyn StateDiscovery> = Arc::new(ControlPlaneDiscovery::new(
            Arc::clone(&registry),
            &config.discovery,
            fingerprints.clone(),
        ));
        let discovery: Arc<dyn StateDiscovery> = Arc::new(CachedStateDiscovery::new(live, cache.clone()));
        let diff = DiffEngine::new(registry.masks());
        let idempotency = Arc::new(idempotency(&config));

        let executor = EnhancedExecutor::new(Arc::clone(&registry), &config, Arc::clone(&idempotency))
            .with_cache(cache.clone());
        let reconciler = ReconciliationManager::new(
            Arc::clone(&discovery),
            diff.clone(),
            fingerprints,
            Arc::clone(&idempotency),
            config.reconciliation.clone(),
        )
        .with_executor(Arc::new(executor.clone()));

        Self {
            config,
            cache,
            discovery,
            diff,
            idempotency,
            executor,
            reconciler: Arc::new(reconciler),
            validator: Validator::new(),
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyManager> {
        &self.idempotency
    }

    pub fn executor(&self) -> &EnhancedExecutor {
        &self.executor
    }

    pub fn reconciler(&self) -> &Arc<ReconciliationManager> {
        &self.reconciler
    }

    /// Progress events of plan execution. Only the first caller gets them.
    pub fn subscribe_progress(&self) -> Option<mpsc::Receiver<ProgressEvent>> {
        self.executor.base().tracker().subscribe()
    }

    /// Start the cache and idempotency cleanup workers and the progress ticker.
    pub fn start(&self, token: &CancellationToken) {
        self.cache.start();
        self.idempotency.start(token);
        self.executor.base().tracker().start(token);
    }

    pub async fn shutdown(&self) {
        self.executor.base().tracker().stop().await;
        self.idempotency.stop().await;
        self.cache.stop().await;
    }

    // ─── Operations ─────────────────────────────────────────────────────────

    pub fn validate(&self, document: &ApplyDocument) -> ValidationReport {
        self.validator.validate(&document.resources)
    }

    /// Validate the document and assemble its desired state.
    pub async fn desired_state(&self, project_id: &str, document: &ApplyDocument) -> Result<ProjectState> {
        let mut warnings = self.validate(document).into_result()?;
        let desired = desired_state(project_id, &document.resources)?;
        warnings.extend(self.validator.check_quotas(project_id, &desired).await?.into_result()?);
        for warning in warnings {
            tracing::warn!(project_id, "{}", warning);
        }
        Ok(desired)
    }

    pub async fn discover(&self, project_id: &str) -> Result<ProjectState> {
        self.discovery.discover_project(project_id).await
    }

    pub async fn plan(&self, project_id: &str, desired: &ProjectState) -> Result<Plan> {
        let current = self.discover(project_id).await?;
        let plan = self.diff.compute_plan(desired, &current)?;
        tracing::info!(
            project_id,
            plan_id = %plan.id,
            operations = plan.operations.len(),
            stages = plan.max_stage + 1,
            "Plan computed"
        );
        Ok(plan)
    }

    /// Deletes for every declared resource that exists live, children first.
    pub async fn destroy_plan(&self, project_id: &str, desired: &ProjectState) -> Result<Plan> {
        let current = self.discover(project_id).await?;
        self.diff.compute_destroy_plan(desired, &current)
    }

    pub async fn apply(&self, plan: &mut Plan, token: &CancellationToken) -> Result<ExecutionResult> {
        self.executor.execute(plan, token).await
    }

    pub async fn detect_drift(&self, project_id: &str, desired: &ProjectState) -> Result<DriftDetectionResult> {
        self.reconciler.detect_drift(project_id, desired).await
    }

    pub async fn reconcile(
        &self,
        detection: &DriftDetectionResult,
        approvals: &Approvals,
        token: &CancellationToken,
    ) -> Result<ReconciliationResult> {
        self.reconciler.reconcile(detection, approvals, token).await
    }
}
