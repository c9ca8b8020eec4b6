use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use matlas::config::types::{EngineConfig, ProgressConfig, RetryConfig, RetryProfile};
use matlas::engine::Engine;
use matlas::executor::engine::{Executor, OperationRunner, PlanExecutor};
use matlas::executor::progress::{ProgressEvent, ProgressTracker};
use matlas::executor::result::{ErrorType, OperationResult};
use matlas::executor::retry::RetryManager;
use matlas::planner::diff::DiffEngine;
use matlas::planner::plan::{OperationStatus, PlanStatus, PlannedOperation};
use matlas::provider::service::ServiceError;
use matlas::state::models::{ProjectState, Resource, ResourceKind};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn profile(max_attempts: u32) -> RetryProfile {
    RetryProfile {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_elapsed_ms: 5_000,
        max_jitter: 0.0,
    }
}

fn cluster(name: &str) -> Resource {
    Resource::new(
        ResourceKind::Cluster,
        name,
        json!({"provider": "AWS", "region": "US_EAST_1", "instanceSize": "M10"}),
    )
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

#[test]
fn test_delay_doubles_until_capped() {
    let profile = RetryProfile {
        max_attempts: 10,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        max_elapsed_ms: 60_000,
        max_jitter: 0.0,
    };
    assert_eq!(RetryManager::calculate_delay(&profile, 0), Duration::from_millis(100));
    assert_eq!(RetryManager::calculate_delay(&profile, 1), Duration::from_millis(200));
    assert_eq!(RetryManager::calculate_delay(&profile, 2), Duration::from_millis(400));
    assert_eq!(RetryManager::calculate_delay(&profile, 5), Duration::from_millis(1_000));
}

#[test]
fn test_delay_jitter_stays_in_bounds() {
    let profile = RetryProfile {
        max_attempts: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
        max_elapsed_ms: 60_000,
        max_jitter: 0.25,
    };
    for _ in 0..50 {
        let delay = RetryManager::calculate_delay(&profile, 0);
        assert!(delay >= Duration::from_millis(1_000));
        assert!(delay <= Duration::from_millis(1_250));
    }
}

#[test]
fn test_default_retry_profiles() {
    let config = RetryConfig::default();
    assert_eq!(config.profile_for(ResourceKind::DatabaseUser).max_attempts, 3);
    assert_eq!(config.profile_for(ResourceKind::Cluster).max_attempts, 5);
    assert_eq!(config.profile_for(ResourceKind::Cluster).base_delay_ms, 5_000);
}

#[test]
fn test_conflict_retry_depends_on_preserve_existing() {
    let conflict = ServiceError::conflict(ResourceKind::Cluster, "c1");
    assert!(RetryManager::new(RetryConfig::default(), false).should_retry(&conflict));
    assert!(!RetryManager::new(RetryConfig::default(), true).should_retry(&conflict));

    let manager = RetryManager::new(RetryConfig::default(), false);
    assert!(manager.should_retry(&ServiceError::Timeout("slow".into())));
    assert!(!manager.should_retry(&ServiceError::Validation("bad".into())));
    assert!(!manager.should_retry(&ServiceError::not_found(ResourceKind::Cluster, "c1")));
}

// ─── Retry Loop ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_until_success() {
    let manager = RetryManager::new(RetryConfig::uniform(profile(5)), false);
    let calls = AtomicU32::new(0);
    let retries = AtomicU32::new(0);
    let token = CancellationToken::new();

    let outcome = manager
        .execute_with_retry(
            ResourceKind::Cluster,
            "Cluster/c1",
            &token,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ServiceError::Throttled("busy".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            |_, _, _| {
                retries.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

    assert_eq!(outcome.result.unwrap(), 2);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(retries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_stops_on_permanent_error() {
    let manager = RetryManager::new(RetryConfig::uniform(profile(5)), false);
    let token = CancellationToken::new();

    let outcome = manager
        .execute_with_retry(
            ResourceKind::Cluster,
            "Cluster/c1",
            &token,
            || async { Err::<(), _>(ServiceError::Unauthorized("no key".into())) },
            |_, _, _| {},
        )
        .await;

    assert_eq!(outcome.attempts, 1);
    assert!(outcome.result.unwrap_err().is_unauthorized());
}

#[tokio::test]
async fn test_retry_exhausts_attempts() {
    let manager = RetryManager::new(RetryConfig::uniform(profile(3)), false);
    let token = CancellationToken::new();

    let outcome = manager
        .execute_with_retry(
            ResourceKind::Cluster,
            "Cluster/c1",
            &token,
            || async {
                Err::<(), _>(ServiceError::Server {
                    status: 502,
                    message: "bad gateway".into(),
                })
            },
            |_, _, _| {},
        )
        .await;

    assert_eq!(outcome.attempts, 3);
    assert!(outcome.result.unwrap_err().is_transient());
}

#[tokio::test]
async fn test_retry_respects_cancellation() {
    let mut slow = profile(5);
    slow.base_delay_ms = 10_000;
    slow.max_delay_ms = 10_000;
    slow.max_elapsed_ms = 60_000;
    let manager = RetryManager::new(RetryConfig::uniform(slow), false);
    let token = CancellationToken::new();
    let cancel = token.clone();

    let outcome = manager
        .execute_with_retry(
            ResourceKind::Cluster,
            "Cluster/c1",
            &token,
            || async { Err::<(), _>(ServiceError::Timeout("slow".into())) },
            move |_, _, _| cancel.cancel(),
        )
        .await;

    assert_eq!(outcome.attempts, 1);
    assert!(matches!(outcome.result, Err(ServiceError::Cancelled)));
}

#[tokio::test]
async fn test_retry_stops_at_wall_clock_ceiling() {
    let manager = RetryManager::new(
        RetryConfig::uniform(RetryProfile {
            max_attempts: 10,
            base_delay_ms: 10,
            max_delay_ms: 10,
            max_elapsed_ms: 50,
            max_jitter: 0.0,
        }),
        false,
    );
    let token = CancellationToken::new();

    let started = std::time::Instant::now();
    let outcome = manager
        .execute_with_retry(
            ResourceKind::Cluster,
            "Cluster/c1",
            &token,
            || async { Err::<(), _>(ServiceError::Timeout("slow".into())) },
            |_, _, _| {},
        )
        .await;

    assert!(outcome.attempts >= 2, "attempts = {}", outcome.attempts);
    assert!(outcome.attempts < 10, "attempts = {}", outcome.attempts);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(outcome.result.unwrap_err().is_transient());
}

// ─── Error Taxonomy ──────────────────────────────────────────────────────────

#[test]
fn test_service_errors_map_to_error_types() {
    let network = ServiceError::Server {
        status: 503,
        message: "down".into(),
    };
    assert_eq!(ErrorType::from(&network), ErrorType::Network);
    let internal = ServiceError::Server {
        status: 400,
        message: "bad".into(),
    };
    assert_eq!(ErrorType::from(&internal), ErrorType::Internal);
    assert_eq!(
        ErrorType::from(&ServiceError::conflict(ResourceKind::Cluster, "c1")),
        ErrorType::Conflict
    );
    assert_eq!(ErrorType::from(&ServiceError::Quota("full".into())), ErrorType::Quota);
    assert!(ErrorType::Network.is_recoverable());
    assert!(!ErrorType::Validation.is_recoverable());
}

// ─── Progress ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_progress_events_bracket_execution() {
    let plane = matlas::provider::memory::MemoryControlPlane::new();
    let mut config = EngineConfig::default();
    config.retry = RetryConfig::uniform(profile(2));
    let engine = Engine::new(plane.registry(), config);
    let mut rx = engine.subscribe_progress().unwrap();
    assert!(engine.subscribe_progress().is_none());

    let desired = ProjectState::new("p1").with(cluster("c1")).unwrap();
    let mut plan = engine.plan("p1", &desired).await.unwrap();
    let token = CancellationToken::new();
    engine.apply(&mut plan, &token).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(ProgressEvent::Start { total: 1, .. })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Complete {
            status: PlanStatus::Completed,
            ..
        })
    ));
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::Operation {
            status: OperationStatus::Completed,
            ..
        }
    )));
}

#[test]
fn test_full_progress_channel_drops_events() {
    let tracker = ProgressTracker::new(&ProgressConfig {
        update_interval_ms: 1_000,
        event_buffer: 1,
    });
    let plan = matlas::planner::plan::Plan::new("p1", Vec::new());
    tracker.begin(&plan);
    tracker.finish(PlanStatus::Completed);

    assert_eq!(tracker.dropped_events(), 2);
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.total, 0);
    assert!((snapshot.percent - 100.0).abs() < f64::EPSILON);
}

// ─── Single Operation ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_execute_single_operation() {
    let plane = matlas::provider::memory::MemoryControlPlane::new();
    let mut config = EngineConfig::default();
    config.retry = RetryConfig::uniform(profile(2));
    let engine = Engine::new(plane.registry(), config.clone());
    let desired = ProjectState::new("p1").with(cluster("c1")).unwrap();
    let plan = engine.plan("p1", &desired).await.unwrap();

    let executor = Executor::new(Arc::new(plane.registry()), &config);
    let token = CancellationToken::new();
    let result = executor.execute_operation("p1", &plan.operations[0], &token).await;

    assert_eq!(result.status, OperationStatus::Completed);
    assert_eq!(result.attempts, 1);
    assert!(result.resource_id.is_some());
    assert_eq!(result.metadata["stateName"], "IDLE");
    assert!(plane.resource("p1", ResourceKind::Cluster, "c1").is_some());
}

// ─── Concurrency ─────────────────────────────────────────────────────────────

/// Records how many operations are in flight at once.
#[derive(Default)]
struct InFlightRunner {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait::async_trait]
impl OperationRunner for InFlightRunner {
    async fn run(&self, _project_id: &str, operation: &PlannedOperation, _token: &CancellationToken) -> OperationResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        let at = chrono::Utc::now();
        OperationResult {
            operation_id: operation.id.clone(),
            status: OperationStatus::Completed,
            resource_id: None,
            error: None,
            attempts: 1,
            started_at: at,
            completed_at: at,
            duration_ms: 20,
            metadata: Default::default(),
        }
    }
}

#[tokio::test]
async fn test_parallel_stage_respects_concurrency_limit() {
    let mut config = EngineConfig::default();
    config.executor.max_concurrent_operations = 2;
    let executor = Executor::new(
        Arc::new(matlas::provider::memory::MemoryControlPlane::new().registry()),
        &config,
    );

    let mut desired = ProjectState::new("p1");
    for i in 0..6 {
        desired
            .push(Resource::new(
                ResourceKind::NetworkAccess,
                format!("office-{}", i),
                json!({"cidrBlock": format!("10.0.{}.0/24", i)}),
            ))
            .unwrap();
    }
    let mut plan = DiffEngine::default().compute_plan(&desired, &ProjectState::new("p1")).unwrap();
    assert_eq!(plan.max_stage, 0);

    let runner = Arc::new(InFlightRunner::default());
    let token = CancellationToken::new();
    let result = executor
        .run_plan(&mut plan, &token, Arc::clone(&runner) as Arc<dyn OperationRunner>)
        .await
        .unwrap();

    assert_eq!(result.status, PlanStatus::Completed);
    assert_eq!(result.summary.completed, 6);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
}

// ─── Cancellation ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_does_not_outlive_running_plans() {
    let plane = matlas::provider::memory::MemoryControlPlane::new();
    let mut config = EngineConfig::default();
    config.retry = RetryConfig::uniform(profile(2));
    let engine = Engine::new(plane.registry(), config);
    let token = CancellationToken::new();

    // Nothing is running, so there is nothing to stop.
    engine.executor().cancel();

    let desired = ProjectState::new("p1").with(cluster("c1")).unwrap();
    let mut plan = engine.plan("p1", &desired).await.unwrap();
    let result = engine.apply(&mut plan, &token).await.unwrap();
    assert_eq!(result.status, PlanStatus::Completed);
    assert!(plane.resource("p1", ResourceKind::Cluster, "c1").is_some());
}

#[tokio::test]
async fn test_cancel_stops_the_running_plan() {
    let plane = matlas::provider::memory::MemoryControlPlane::new().with_latency(Duration::from_millis(200));
    let mut config = EngineConfig::default();
    config.retry = RetryConfig::uniform(profile(2));
    let engine = Engine::new(plane.registry(), config);
    let token = CancellationToken::new();

    let desired = ProjectState::new("p1").with(cluster("c1")).unwrap();
    let mut plan = engine.plan("p1", &desired).await.unwrap();

    let (result, ()) = tokio::join!(engine.apply(&mut plan, &token), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.executor().cancel();
    });
    assert_eq!(result.unwrap().status, PlanStatus::Cancelled);
    assert!(!token.is_cancelled());
}
