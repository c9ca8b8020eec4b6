use matlas::config::manifest::{desired_state, Manifest};
use matlas::config::types::{EngineConfig, RetryConfig, RetryProfile};
use matlas::engine::Engine;
use matlas::executor::result::ErrorType;
use matlas::planner::plan::{ChangeType, OperationStatus, OperationType, PlanStatus};
use matlas::provider::memory::{Fault, FaultOp, MemoryControlPlane};
use matlas::provider::service::{ResourceService, ServiceError};
use matlas::reconcile::drift::{Complexity, DriftType};
use matlas::reconcile::manager::{Approvals, DriftOutcomeStatus};
use matlas::reconcile::rules::ReconcileAction;
use matlas::recovery::manager::{RecoveryResult, RecoveryStrategy};
use matlas::state::models::{DeletionPolicy, ProjectState, Resource, ResourceKind};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const PROJECT: &str = "proj-1";

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry = RetryConfig::uniform(RetryProfile {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_elapsed_ms: 1_000,
        max_jitter: 0.0,
    });
    config.recovery.retry_delay_ms = 1;
    config
}

fn cluster(name: &str) -> Manifest {
    Manifest::new(
        ResourceKind::Cluster,
        name,
        json!({"provider": "AWS", "region": "US_EAST_1", "instanceSize": "M10"}),
    )
}

fn user(name: &str) -> Manifest {
    Manifest::new(
        ResourceKind::DatabaseUser,
        name,
        json!({
            "username": name,
            "password": "s3cret",
            "roles": [{"roleName": "readWrite", "databaseName": "app"}]
        }),
    )
}

fn desired(manifests: &[Manifest]) -> ProjectState {
    desired_state(PROJECT, manifests).unwrap()
}

fn live_cluster(name: &str) -> Resource {
    Resource::new(
        ResourceKind::Cluster,
        name,
        json!({"provider": "AWS", "region": "US_EAST_1", "instanceSize": "M10"}),
    )
}

// ─── Apply ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fresh_apply_creates_in_dependency_order() {
    let plane = MemoryControlPlane::new();
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();
    let wanted = desired(&[cluster("c1"), user("u1")]);

    let mut plan = engine.plan(PROJECT, &wanted).await.unwrap();
    assert_eq!(plan.summary().creates, 2);

    let cluster_op = plan.operations.iter().find(|op| op.kind() == ResourceKind::Cluster).unwrap();
    let user_op = plan.operations.iter().find(|op| op.kind() == ResourceKind::DatabaseUser).unwrap();
    assert!(cluster_op.stage() < user_op.stage());
    assert!(user_op.depends_on.contains(&cluster_op.id));

    let result = engine.apply(&mut plan, &token).await.unwrap();
    assert_eq!(result.status, PlanStatus::Completed);
    assert_eq!(result.summary.completed, 2);
    assert_eq!(result.summary.failed, 0);
    assert_eq!(plane.mutation_count(), 2);

    let live = plane.resource(PROJECT, ResourceKind::Cluster, "c1").unwrap();
    assert_eq!(live.spec["stateName"], "IDLE");
    let live_user = plane.resource(PROJECT, ResourceKind::DatabaseUser, "u1").unwrap();
    assert!(live_user.spec.get("password").is_none());
}

#[tokio::test]
async fn test_reapply_is_a_no_op() {
    let plane = MemoryControlPlane::new();
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();
    let wanted = desired(&[cluster("c1"), user("u1")]);

    let mut first = engine.plan(PROJECT, &wanted).await.unwrap();
    engine.apply(&mut first, &token).await.unwrap();
    assert_eq!(plane.mutation_count(), 2);

    let mut second = engine.plan(PROJECT, &wanted).await.unwrap();
    assert!(!second.has_changes());
    assert_eq!(second.summary().no_changes, 2);

    let result = engine.apply(&mut second, &token).await.unwrap();
    assert_eq!(result.status, PlanStatus::Completed);
    assert_eq!(result.summary.skipped, 2);
    assert_eq!(result.summary.completed, 2);
    for outcome in result.operation_results.values() {
        assert_eq!(outcome.status, OperationStatus::Skipped);
        assert_eq!(outcome.note(), Some("already applied"));
        assert!(outcome.metadata.contains_key("duplicateOf"));
    }
    assert_eq!(plane.mutation_count(), 2);
}

#[tokio::test]
async fn test_replaying_the_same_plan_skips_its_mutations() {
    let plane = MemoryControlPlane::new();
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut plan = engine.plan(PROJECT, &desired(&[cluster("c1")])).await.unwrap();
    engine.apply(&mut plan, &token).await.unwrap();
    assert_eq!(plane.mutation_count(), 1);

    let replay = engine.apply(&mut plan, &token).await.unwrap();
    assert_eq!(replay.status, PlanStatus::Completed);
    assert_eq!(replay.summary.skipped, 1);
    assert_eq!(plane.mutation_count(), 1);
}

#[tokio::test]
async fn test_flip_flopping_value_converges_every_time() {
    let plane = MemoryControlPlane::new();
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    for size in ["M10", "M20", "M10", "M20"] {
        let mut manifest = cluster("c1");
        manifest.spec["instanceSize"] = json!(size);
        let mut plan = engine.plan(PROJECT, &desired(&[manifest])).await.unwrap();
        assert!(plan.has_changes());

        let result = engine.apply(&mut plan, &token).await.unwrap();
        assert_eq!(result.status, PlanStatus::Completed);
        assert_eq!(result.summary.skipped, 0, "{} was skipped", size);
        let live = plane.resource(PROJECT, ResourceKind::Cluster, "c1").unwrap();
        assert_eq!(live.spec["instanceSize"], size);
    }
    assert_eq!(plane.mutation_count(), 4);
}

#[tokio::test]
async fn test_resource_deleted_out_of_band_is_recreated() {
    let plane = MemoryControlPlane::new();
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();
    let wanted = desired(&[cluster("c1")]);

    let mut first = engine.plan(PROJECT, &wanted).await.unwrap();
    engine.apply(&mut first, &token).await.unwrap();

    let live = plane.resource(PROJECT, ResourceKind::Cluster, "c1").unwrap();
    plane.service(ResourceKind::Cluster).delete(PROJECT, &live).await.unwrap();
    // Out-of-band changes are only visible once the cached state is gone.
    engine.cache().delete(PROJECT);

    let mut second = engine.plan(PROJECT, &wanted).await.unwrap();
    assert_eq!(second.summary().creates, 1);
    let result = engine.apply(&mut second, &token).await.unwrap();
    assert_eq!(result.status, PlanStatus::Completed);
    assert_eq!(result.summary.skipped, 0);
    let outcome = result.operation_results.values().next().unwrap();
    assert_eq!(outcome.status, OperationStatus::Completed);
    assert_eq!(outcome.note(), None);
    assert!(plane.resource(PROJECT, ResourceKind::Cluster, "c1").is_some());
}

#[tokio::test]
async fn test_transient_failure_rolls_back_partial_create() {
    let plane = MemoryControlPlane::new();
    plane.inject_fault(
        Fault::new(ServiceError::Server {
            status: 503,
            message: "service unavailable".to_string(),
        })
        .on(ResourceKind::Cluster, "c2")
        .during(FaultOp::Create),
    );
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();
    let wanted = desired(&[cluster("c1"), cluster("c2")]);

    let mut plan = engine.plan(PROJECT, &wanted).await.unwrap();
    let result = engine.apply(&mut plan, &token).await.unwrap();
    assert_eq!(result.status, PlanStatus::Failed);
    assert_eq!(result.summary.failed, 1);

    let failed_op = plan.operations.iter().find(|op| op.name() == "c2").unwrap();
    let outcome = result.result(&failed_op.id).unwrap();
    assert_eq!(outcome.status, OperationStatus::Failed);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.error.as_ref().unwrap().error_type, ErrorType::Network);

    let recovery: RecoveryResult = serde_json::from_value(outcome.metadata["recovery"].clone()).unwrap();
    assert_eq!(recovery.strategy, RecoveryStrategy::Rollback);
    assert!(recovery.rollback_performed);
    assert_eq!(recovery.resources_cleaned, vec!["c2".to_string()]);
    assert!(engine.executor().recovery_result(&failed_op.id).is_some());

    // The unaffected cluster still converged.
    assert!(plane.resource(PROJECT, ResourceKind::Cluster, "c1").is_some());
    assert!(plane.resource(PROJECT, ResourceKind::Cluster, "c2").is_none());
}

#[tokio::test]
async fn test_retry_recovers_from_single_transient_failure() {
    let plane = MemoryControlPlane::new();
    plane.inject_fault(
        Fault::new(ServiceError::Throttled("slow down".to_string()))
            .on(ResourceKind::Cluster, "c1")
            .during(FaultOp::Create)
            .times(1),
    );
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut plan = engine.plan(PROJECT, &desired(&[cluster("c1")])).await.unwrap();
    let result = engine.apply(&mut plan, &token).await.unwrap();

    assert_eq!(result.status, PlanStatus::Completed);
    assert_eq!(result.summary.retried, 1);
    let outcome = result.operation_results.values().next().unwrap();
    assert_eq!(outcome.attempts, 2);
    assert!(outcome.retried());
}

#[tokio::test]
async fn test_recovered_update_leaves_no_stale_cache() {
    let plane = MemoryControlPlane::new();
    plane.seed(PROJECT, live_cluster("c1"));
    plane.inject_fault(
        Fault::new(ServiceError::Server {
            status: 503,
            message: "service unavailable".to_string(),
        })
        .on(ResourceKind::Cluster, "c1")
        .during(FaultOp::Update)
        .times(2),
    );
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut manifest = cluster("c1");
    manifest.spec["instanceSize"] = json!("M20");
    let wanted = desired(&[manifest]);

    let mut plan = engine.plan(PROJECT, &wanted).await.unwrap();
    assert!(engine.cache().contains(PROJECT));
    let result = engine.apply(&mut plan, &token).await.unwrap();
    assert_eq!(result.status, PlanStatus::Completed);
    let outcome = result.operation_results.values().next().unwrap();
    assert_eq!(outcome.note(), Some("recovered by retry"));
    assert!(!engine.cache().contains(PROJECT));

    let live = plane.resource(PROJECT, ResourceKind::Cluster, "c1").unwrap();
    assert_eq!(live.spec["instanceSize"], "M20");
    let detection = engine.detect_drift(PROJECT, &wanted).await.unwrap();
    assert!(!detection.has_drift(), "{:?}", detection.drifts);
}

#[tokio::test]
async fn test_failed_call_invalidates_cached_state() {
    let plane = MemoryControlPlane::new();
    plane.inject_fault(
        Fault::new(ServiceError::Quota("cluster limit reached".to_string()))
            .on(ResourceKind::Cluster, "c1")
            .during(FaultOp::Create),
    );
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut plan = engine.plan(PROJECT, &desired(&[cluster("c1")])).await.unwrap();
    assert!(engine.cache().contains(PROJECT));
    let result = engine.apply(&mut plan, &token).await.unwrap();
    assert_eq!(result.status, PlanStatus::Failed);
    assert!(!engine.cache().contains(PROJECT));
}

// ─── Failure Propagation ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_unauthorized_failure_stops_later_stages() {
    let plane = MemoryControlPlane::new();
    plane.inject_fault(
        Fault::new(ServiceError::Unauthorized("invalid API key".to_string()))
            .on(ResourceKind::Cluster, "c1")
            .during(FaultOp::Create),
    );
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut plan = engine.plan(PROJECT, &desired(&[cluster("c1"), user("u1")])).await.unwrap();
    let result = engine.apply(&mut plan, &token).await.unwrap();

    assert_eq!(result.status, PlanStatus::Failed);
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.summary.pending, 1);
    let user_op = plan.operations.iter().find(|op| op.kind() == ResourceKind::DatabaseUser).unwrap();
    assert!(result.result(&user_op.id).is_none());
    assert_eq!(user_op.status, OperationStatus::Pending);
    assert_eq!(plan.status, PlanStatus::Failed);
    let cluster_op = plan.operations.iter().find(|op| op.kind() == ResourceKind::Cluster).unwrap();
    assert_eq!(
        result.result(&cluster_op.id).unwrap().error.as_ref().unwrap().error_type,
        ErrorType::Authentication
    );
    assert!(plane.resource(PROJECT, ResourceKind::DatabaseUser, "u1").is_none());
}

#[tokio::test]
async fn test_dependents_of_failed_operation_are_not_dispatched() {
    let plane = MemoryControlPlane::new();
    plane.inject_fault(
        Fault::new(ServiceError::Quota("cluster limit reached".to_string()))
            .on(ResourceKind::Cluster, "c1")
            .during(FaultOp::Create),
    );
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut plan = engine.plan(PROJECT, &desired(&[cluster("c1"), user("u1")])).await.unwrap();
    let result = engine.apply(&mut plan, &token).await.unwrap();

    assert_eq!(result.status, PlanStatus::Failed);
    assert_eq!(result.summary.failed, 2);
    assert_eq!(result.summary.pending, 0);
    let user_op = plan.operations.iter().find(|op| op.kind() == ResourceKind::DatabaseUser).unwrap();
    let outcome = result.result(&user_op.id).unwrap();
    assert_eq!(outcome.status, OperationStatus::Failed);
    assert_eq!(outcome.attempts, 0);
    assert_eq!(outcome.error.as_ref().unwrap().error_type, ErrorType::Dependency);
    assert!(plane.resource(PROJECT, ResourceKind::DatabaseUser, "u1").is_none());
    assert_eq!(plane.mutation_count(), 0);
}

#[tokio::test]
async fn test_preserve_existing_accepts_conflicting_create() {
    let plane = MemoryControlPlane::new();
    plane.inject_fault(
        Fault::new(ServiceError::conflict(ResourceKind::DatabaseUser, "u1"))
            .on(ResourceKind::DatabaseUser, "u1")
            .during(FaultOp::Create),
    );
    let mut config = test_config();
    config.executor.preserve_existing = true;
    let engine = Engine::new(plane.registry(), config);
    let token = CancellationToken::new();

    let mut plan = engine.plan(PROJECT, &desired(&[user("u1")])).await.unwrap();
    let result = engine.apply(&mut plan, &token).await.unwrap();

    assert_eq!(result.status, PlanStatus::Completed);
    let outcome = result.operation_results.values().next().unwrap();
    assert_eq!(outcome.status, OperationStatus::Completed);
    assert_eq!(outcome.note(), Some("preserved"));
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn test_conflicting_create_fails_without_preserve_existing() {
    let plane = MemoryControlPlane::new();
    plane.inject_fault(
        Fault::new(ServiceError::conflict(ResourceKind::DatabaseUser, "u1"))
            .on(ResourceKind::DatabaseUser, "u1")
            .during(FaultOp::Create),
    );
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut plan = engine.plan(PROJECT, &desired(&[user("u1")])).await.unwrap();
    let result = engine.apply(&mut plan, &token).await.unwrap();

    assert_eq!(result.status, PlanStatus::Failed);
    let outcome = result.operation_results.values().next().unwrap();
    assert_eq!(outcome.error.as_ref().unwrap().error_type, ErrorType::Conflict);
}

#[tokio::test]
async fn test_cancelled_before_apply_dispatches_nothing() {
    let plane = MemoryControlPlane::new();
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut plan = engine.plan(PROJECT, &desired(&[cluster("c1")])).await.unwrap();
    token.cancel();
    let result = engine.apply(&mut plan, &token).await.unwrap();

    assert_eq!(result.status, PlanStatus::Cancelled);
    assert_eq!(result.summary.pending, 1);
    assert_eq!(plane.mutation_count(), 0);
}

#[tokio::test]
async fn test_removed_manifest_plans_delete() {
    let plane = MemoryControlPlane::new();
    plane.seed(PROJECT, live_cluster("c1"));
    plane.seed(PROJECT, live_cluster("old"));
    let engine = Engine::new(plane.registry(), test_config());

    let plan = engine.plan(PROJECT, &desired(&[cluster("c1")])).await.unwrap();
    let summary = plan.summary();
    assert_eq!(summary.deletes, 1);
    assert_eq!(summary.no_changes, 1);
    let delete = plan
        .operations
        .iter()
        .find(|op| op.op_type() == OperationType::Delete)
        .unwrap();
    assert_eq!(delete.name(), "old");
    assert!(delete.impact().is_destructive);
}

// ─── Destroy ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_destroy_deletes_children_first_and_honors_policies() {
    let plane = MemoryControlPlane::new();
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut snapshot_cluster = cluster("c1");
    snapshot_cluster.metadata.deletion_policy = DeletionPolicy::Snapshot;
    let mut kept_cluster = cluster("keep");
    kept_cluster.metadata.deletion_policy = DeletionPolicy::Retain;
    let wanted = desired(&[snapshot_cluster, kept_cluster, user("u1")]);

    let mut plan = engine.plan(PROJECT, &wanted).await.unwrap();
    engine.apply(&mut plan, &token).await.unwrap();
    assert_eq!(plane.resources(PROJECT).len(), 3);

    let mut destroy = engine.destroy_plan(PROJECT, &wanted).await.unwrap();
    assert_eq!(destroy.summary().deletes, 2);
    let user_op = destroy.operations.iter().find(|op| op.name() == "u1").unwrap();
    let cluster_op = destroy.operations.iter().find(|op| op.name() == "c1").unwrap();
    assert!(user_op.stage() < cluster_op.stage());

    let result = engine.apply(&mut destroy, &token).await.unwrap();
    assert_eq!(result.status, PlanStatus::Completed);
    assert!(plane.resource(PROJECT, ResourceKind::Cluster, "c1").is_none());
    assert!(plane.resource(PROJECT, ResourceKind::Cluster, "keep").is_some());
    assert_eq!(plane.snapshots_taken(), vec!["Cluster/c1".to_string()]);
}

#[tokio::test]
async fn test_delete_of_missing_resource_counts_as_done() {
    let plane = MemoryControlPlane::new();
    plane.seed(PROJECT, live_cluster("c1"));
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();
    let wanted = desired(&[cluster("c1")]);

    let mut destroy = engine.destroy_plan(PROJECT, &wanted).await.unwrap();
    // Someone else removes it between planning and applying.
    plane.inject_fault(
        Fault::new(ServiceError::not_found(ResourceKind::Cluster, "c1"))
            .on(ResourceKind::Cluster, "c1")
            .during(FaultOp::Delete),
    );
    let result = engine.apply(&mut destroy, &token).await.unwrap();

    assert_eq!(result.status, PlanStatus::Completed);
    let outcome = result.operation_results.values().next().unwrap();
    assert_eq!(outcome.note(), Some("already deleted"));
}

// ─── Drift ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_label_drift_is_auto_fixed() {
    let plane = MemoryControlPlane::new();
    plane.seed(PROJECT, live_cluster("c1").with_label("env", "staging"));
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();

    let mut manifest = cluster("c1");
    manifest.metadata.labels.insert("env".to_string(), "prod".to_string());
    let wanted = desired(&[manifest]);

    let detection = engine.detect_drift(PROJECT, &wanted).await.unwrap();
    assert!(detection.has_drift());
    assert_eq!(detection.drifts.len(), 1);
    let drift = &detection.drifts[0];
    assert_eq!(drift.drift_type, DriftType::Metadata);
    assert_eq!(drift.complexity, Complexity::Simple);
    assert_eq!(drift.action, ReconcileAction::AutoFix);
    assert!(drift.auto_fix);

    let result = engine.reconcile(&detection, &Approvals::none(), &token).await.unwrap();
    let outcome = result.outcome(&drift.id).unwrap();
    assert_eq!(outcome.status, DriftOutcomeStatus::Fixed);
    assert!(outcome.checkpoint_id.is_some());
    assert_eq!(outcome.field_changes.len(), 1);
    let change = &outcome.field_changes[0];
    assert_eq!(change.path, "metadata.labels.env");
    assert_eq!(change.old_value, Some(json!("staging")));
    assert_eq!(change.new_value, Some(json!("prod")));
    assert_eq!(change.change_type, ChangeType::Modify);

    // Fixes are only recorded unless applyFixes is set.
    assert!(result.execution.is_none());
    let live = plane.resource(PROJECT, ResourceKind::Cluster, "c1").unwrap();
    assert_eq!(live.metadata.labels["env"], "staging");
}

#[tokio::test]
async fn test_auto_fix_applies_when_enabled() {
    let plane = MemoryControlPlane::new();
    plane.seed(PROJECT, live_cluster("c1").with_label("env", "staging"));
    let mut config = test_config();
    config.reconciliation.apply_fixes = true;
    let engine = Engine::new(plane.registry(), config);
    let token = CancellationToken::new();

    let mut manifest = cluster("c1");
    manifest.metadata.labels.insert("env".to_string(), "prod".to_string());
    let wanted = desired(&[manifest]);

    let detection = engine.detect_drift(PROJECT, &wanted).await.unwrap();
    let result = engine.reconcile(&detection, &Approvals::none(), &token).await.unwrap();
    assert_eq!(result.count(DriftOutcomeStatus::Fixed), 1);
    assert_eq!(result.execution.as_ref().unwrap().status, PlanStatus::Completed);

    let live = plane.resource(PROJECT, ResourceKind::Cluster, "c1").unwrap();
    assert_eq!(live.metadata.labels["env"], "prod");

    let again = engine.detect_drift(PROJECT, &wanted).await.unwrap();
    assert!(!again.has_drift());
}

#[tokio::test]
async fn test_missing_resource_drift_awaits_approval() {
    let plane = MemoryControlPlane::new();
    let engine = Engine::new(plane.registry(), test_config());
    let token = CancellationToken::new();
    let wanted = desired(&[cluster("c1")]);

    let detection = engine.detect_drift(PROJECT, &wanted).await.unwrap();
    let drift = &detection.drifts[0];
    assert_eq!(drift.drift_type, DriftType::Deleted);
    assert_eq!(drift.action, ReconcileAction::Prompt);

    let pending = engine.reconcile(&detection, &Approvals::none(), &token).await.unwrap();
    assert_eq!(pending.count(DriftOutcomeStatus::AwaitingApproval), 1);

    let approved = engine
        .reconcile(&detection, &Approvals::none().approve(drift.id.clone()), &token)
        .await
        .unwrap();
    assert_eq!(approved.count(DriftOutcomeStatus::Fixed), 1);
}

#[tokio::test]
async fn test_repeated_drift_counts_occurrences() {
    let plane = MemoryControlPlane::new();
    plane.seed(PROJECT, live_cluster("c1").with_label("env", "staging"));
    let engine = Engine::new(plane.registry(), test_config());

    let mut manifest = cluster("c1");
    manifest.metadata.labels.insert("env".to_string(), "prod".to_string());
    let wanted = desired(&[manifest]);

    let first = engine.detect_drift(PROJECT, &wanted).await.unwrap();
    let second = engine.detect_drift(PROJECT, &wanted).await.unwrap();
    assert_eq!(first.drifts[0].occurrences, 1);
    assert_eq!(second.drifts[0].occurrences, 2);
    assert_eq!(second.drifts[0].first_seen, first.drifts[0].first_seen);
    assert_eq!(second.drifts[0].fingerprint, first.drifts[0].fingerprint);
}

#[tokio::test]
async fn test_scheduled_reconciliation_fixes_drift_until_cancelled() {
    let plane = MemoryControlPlane::new();
    plane.seed(PROJECT, live_cluster("c1").with_label("env", "staging"));
    let mut config = test_config();
    config.reconciliation.apply_fixes = true;
    config.reconciliation.schedule_interval_secs = 1;
    let engine = Engine::new(plane.registry(), config);

    let mut manifest = cluster("c1");
    manifest.metadata.labels.insert("env".to_string(), "prod".to_string());
    let token = CancellationToken::new();
    let handle = engine
        .reconciler()
        .schedule_reconciliation(PROJECT.to_string(), desired(&[manifest]), token.clone());

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let live = plane.resource(PROJECT, ResourceKind::Cluster, "c1").unwrap();
        if live.metadata.labels["env"] == "prod" {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "drift was never fixed");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    token.cancel();
    handle.await.unwrap();
}
