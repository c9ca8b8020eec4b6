use std::sync::Arc;
use std::time::Duration;

use matlas::config::types::{CacheConfig, EngineConfig, FingerprintConfig};
use matlas::engine::Engine;
use matlas::provider::memory::{Fault, FaultOp, MemoryControlPlane};
use matlas::provider::service::ServiceError;
use matlas::state::cache::StateCache;
use matlas::state::discovery::{ControlPlaneDiscovery, StateDiscovery};
use matlas::state::fingerprint::FingerprintEngine;
use matlas::state::models::{
    ClusterSpec, DatabaseUserSpec, ProjectState, Resource, ResourceKind, RoleAssignment,
};
use matlas::state::sqlite::SqliteIdempotencyStore;
use serde_json::json;

fn cache(max_entries: usize) -> StateCache {
    StateCache::new(&CacheConfig {
        default_ttl_secs: 300,
        max_entries,
        cleanup_interval_secs: 60,
    })
}

fn cluster(name: &str) -> Resource {
    Resource::new(
        ResourceKind::Cluster,
        name,
        json!({"provider": "AWS", "region": "US_EAST_1", "instanceSize": "M10"}),
    )
}

// ─── Cache ───────────────────────────────────────────────────────────────────

#[test]
fn test_cache_evicts_least_recently_used() {
    let cache = cache(2);
    cache.set("a", ProjectState::new("a"), Duration::ZERO);
    cache.set("b", ProjectState::new("b"), Duration::ZERO);

    // Touch "a" so "b" becomes the eviction victim.
    assert!(cache.get("a").is_some());
    cache.set("c", ProjectState::new("c"), Duration::ZERO);

    assert!(cache.contains("a"));
    assert!(!cache.contains("b"));
    assert!(cache.contains("c"));

    let stats = cache.stats();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.evicts, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_cache_overwrite_does_not_evict() {
    let cache = cache(2);
    cache.set("a", ProjectState::new("a"), Duration::ZERO);
    cache.set("b", ProjectState::new("b"), Duration::ZERO);
    cache.set("a", ProjectState::new("a"), Duration::ZERO);

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().evicts, 0);
}

#[test]
fn test_cache_expired_entry_is_a_miss() {
    let cache = cache(10);
    cache.set("a", ProjectState::new("a"), Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(20));

    assert!(cache.get("a").is_none());
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.expires, 1);
    assert!(cache.is_empty());
}

#[test]
fn test_cache_cleanup_purges_expired_entries() {
    let cache = cache(10);
    cache.set("short", ProjectState::new("short"), Duration::from_millis(1));
    cache.set("long", ProjectState::new("long"), Duration::from_secs(60));
    std::thread::sleep(Duration::from_millis(20));

    assert_eq!(cache.cleanup(), 1);
    assert!(cache.contains("long"));
    assert!(cache.stats().last_cleanup.is_some());
}

#[test]
fn test_cache_invalidate_by_kind() {
    let cache = cache(10);
    let with_cluster = ProjectState::new("p1").with(cluster("c1")).unwrap();
    cache.set("p1", with_cluster, Duration::ZERO);
    cache.set("p2", ProjectState::new("p2"), Duration::ZERO);

    assert_eq!(cache.invalidate_by_resource_kind(ResourceKind::Cluster), 1);
    assert!(!cache.contains("p1"));
    assert!(cache.contains("p2"));
    assert!(cache.invalidate_by_resource("p2", ResourceKind::Cluster, "c9"));
    assert!(cache.is_empty());
}

#[test]
fn test_cache_hit_rate() {
    let cache = cache(10);
    cache.set("a", ProjectState::new("a"), Duration::ZERO);
    cache.get("a");
    cache.get("missing");

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_cache_worker_start_stop() {
    let cache = cache(10);
    cache.start();
    cache.start();
    assert!(cache.is_running());
    cache.stop().await;
    assert!(!cache.is_running());
}

// ─── Fingerprints ────────────────────────────────────────────────────────────

#[test]
fn test_fingerprint_ignores_key_order() {
    let engine = FingerprintEngine::default();
    let a = json!({"region": "US_EAST_1", "provider": "AWS", "nested": {"b": 1, "a": 2}});
    let b = json!({"nested": {"a": 2, "b": 1}, "provider": "AWS", "region": "US_EAST_1"});
    assert_eq!(
        engine.fingerprint_value(&a, ResourceKind::Cluster),
        engine.fingerprint_value(&b, ResourceKind::Cluster)
    );
}

#[test]
fn test_fingerprint_ignores_server_timestamps() {
    let engine = FingerprintEngine::default();
    let a = json!({"provider": "AWS", "createdAt": "2024-01-01T00:00:00Z"});
    let b = json!({"provider": "AWS", "createdAt": "2025-06-30T12:00:00Z"});
    assert_eq!(
        engine.fingerprint_value(&a, ResourceKind::Cluster),
        engine.fingerprint_value(&b, ResourceKind::Cluster)
    );
}

#[test]
fn test_fingerprint_depends_on_kind_and_content() {
    let engine = FingerprintEngine::default();
    let value = json!({"name": "x"});
    assert_ne!(
        engine.fingerprint_value(&value, ResourceKind::Cluster),
        engine.fingerprint_value(&value, ResourceKind::DatabaseUser)
    );
    assert_ne!(
        engine.fingerprint_value(&json!({"name": "x"}), ResourceKind::Cluster),
        engine.fingerprint_value(&json!({"name": "y"}), ResourceKind::Cluster)
    );
}

#[test]
fn test_fingerprint_hashes_exactly_the_canonical_document() {
    use sha2::{Digest, Sha256};

    let engine = FingerprintEngine::default();
    let value = json!({"b": 1, "a": "x"});
    let document = engine.canonical_document(&value, ResourceKind::Cluster);
    assert_eq!(document, r#"{"kind":"Cluster","resource":{"a":"x","b":1}}"#);
    assert_eq!(
        engine.fingerprint_value(&value, ResourceKind::Cluster),
        hex::encode(Sha256::digest(document.as_bytes()))
    );
    assert_ne!(document, engine.canonical_document(&value, ResourceKind::DatabaseUser));
}

#[test]
fn test_fingerprint_include_fields() {
    let engine = FingerprintEngine::new(&FingerprintConfig {
        ignore_metadata_fields: Vec::new(),
        include_fields: vec!["provider".to_string()],
    });
    let a = json!({"provider": "AWS", "region": "US_EAST_1"});
    let b = json!({"provider": "AWS", "region": "EU_WEST_1"});
    assert_eq!(
        engine.fingerprint_value(&a, ResourceKind::Cluster),
        engine.fingerprint_value(&b, ResourceKind::Cluster)
    );
}

#[test]
fn test_state_fingerprint_is_order_independent() {
    let engine = FingerprintEngine::default();
    let one = ProjectState::new("p")
        .with(cluster("a"))
        .unwrap()
        .with(cluster("b"))
        .unwrap();
    let two = ProjectState::new("p")
        .with(cluster("b"))
        .unwrap()
        .with(cluster("a"))
        .unwrap();
    assert_eq!(
        engine.fingerprint_state(&one).unwrap(),
        engine.fingerprint_state(&two).unwrap()
    );
}

// ─── Models ──────────────────────────────────────────────────────────────────

#[test]
fn test_resource_kind_parses_case_insensitively() {
    assert_eq!("cluster".parse::<ResourceKind>().unwrap(), ResourceKind::Cluster);
    assert_eq!("VPCENDPOINT".parse::<ResourceKind>().unwrap(), ResourceKind::VpcEndpoint);
    assert!("Bucket".parse::<ResourceKind>().is_err());
}

#[test]
fn test_project_state_rejects_duplicates() {
    let state = ProjectState::new("p").with(cluster("c1")).unwrap();
    assert!(state.with(cluster("c1")).is_err());
}

#[test]
fn test_typed_spec_round_trip() {
    let spec = DatabaseUserSpec {
        username: "app".to_string(),
        password: None,
        auth_database: "admin".to_string(),
        roles: vec![RoleAssignment {
            role_name: "read".to_string(),
            database_name: "app".to_string(),
            collection_name: None,
        }],
        scopes: Vec::new(),
    };
    let resource = Resource::from_spec("app", &spec).unwrap();
    assert_eq!(resource.kind, ResourceKind::DatabaseUser);
    assert_eq!(resource.typed_spec::<DatabaseUserSpec>().unwrap(), spec);
    assert!(resource.typed_spec::<ClusterSpec>().is_err());
}

// ─── Memory Control Plane ────────────────────────────────────────────────────

#[test]
fn test_memory_plane_snapshot_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let plane = MemoryControlPlane::new();
    plane.seed("p1", cluster("c1").with_label("env", "prod"));
    plane.save(&path).unwrap();

    let loaded = MemoryControlPlane::load(&path).unwrap();
    let live = loaded.resource("p1", ResourceKind::Cluster, "c1").unwrap();
    assert_eq!(live.metadata.labels["env"], "prod");
    assert_eq!(live.spec["stateName"], "IDLE");
    assert_eq!(loaded.resources("p1").len(), 1);
}

#[test]
fn test_memory_plane_load_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let plane = MemoryControlPlane::load(&dir.path().join("absent.json")).unwrap();
    assert!(plane.resources("p1").is_empty());
}

// ─── Discovery ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_discovery_is_served_from_cache() {
    let plane = MemoryControlPlane::new();
    plane.seed("p1", cluster("c1"));
    let engine = Engine::new(plane.registry(), EngineConfig::default());

    let first = engine.discover("p1").await.unwrap();
    let calls = plane.call_count();
    let second = engine.discover("p1").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(plane.call_count(), calls);
    assert_eq!(engine.cache().stats().hits, 1);
    assert!(!first.fingerprint.is_empty());
}

#[tokio::test]
async fn test_discovery_fails_while_a_kind_cannot_be_listed() {
    let plane = MemoryControlPlane::new();
    plane.seed("p1", cluster("c1"));
    plane.inject_fault(
        Fault::new(ServiceError::Unauthorized("no key".into()))
            .on_kind(ResourceKind::Cluster)
            .during(FaultOp::List),
    );
    let engine = Engine::new(plane.registry(), EngineConfig::default());

    let err = engine.discover("p1").await.unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to discover Cluster"));

    plane.clear_faults();
    let state = engine.discover("p1").await.unwrap();
    assert!(state.contains(ResourceKind::Cluster, "c1"));
}

#[tokio::test]
async fn test_plane_latency_delays_discovery() {
    let plane = MemoryControlPlane::new().with_latency(Duration::from_millis(20));
    let engine = Engine::new(plane.registry(), EngineConfig::default());

    let started = std::time::Instant::now();
    engine.discover("p1").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[tokio::test]
async fn test_discovery_by_kind() {
    let plane = MemoryControlPlane::new();
    plane.seed("p1", cluster("c1"));
    plane.seed(
        "p1",
        Resource::new(ResourceKind::NetworkAccess, "office", json!({"cidrBlock": "10.0.0.0/24"})),
    );
    let config = EngineConfig::default();
    let discovery = ControlPlaneDiscovery::new(
        Arc::new(plane.registry()),
        &config.discovery,
        FingerprintEngine::new(&config.fingerprint),
    );

    let clusters = discovery.discover_clusters("p1").await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].name(), "c1");
    assert_eq!(discovery.discover_network_access("p1").await.unwrap().len(), 1);
    assert!(discovery.discover_database_users("p1").await.unwrap().is_empty());
    assert!(discovery.discover_search_indexes("p1").await.unwrap().is_empty());
    assert!(discovery.discover_project_settings("p1").await.unwrap().is_none());
}

// ─── Durable Idempotency ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_sqlite_store_restores_operation_states() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("idempotency.db");
    let db = db.to_string_lossy().to_string();
    let plane = MemoryControlPlane::new();
    let token = tokio_util::sync::CancellationToken::new();

    let desired = ProjectState::new("p1").with(cluster("c1")).unwrap();
    {
        let store = Arc::new(SqliteIdempotencyStore::open(&db).unwrap());
        let engine = Engine::with_idempotency_store(plane.registry(), EngineConfig::default(), store)
            .await
            .unwrap();
        let mut plan = engine.plan("p1", &desired).await.unwrap();
        engine.apply(&mut plan, &token).await.unwrap();
        assert_eq!(engine.idempotency().state_count(), 1);
    }

    let store = Arc::new(SqliteIdempotencyStore::open(&db).unwrap());
    let engine = Engine::with_idempotency_store(plane.registry(), EngineConfig::default(), store)
        .await
        .unwrap();
    assert_eq!(engine.idempotency().state_count(), 1);
    assert_eq!(engine.idempotency().states_for_project("p1").len(), 1);
}
