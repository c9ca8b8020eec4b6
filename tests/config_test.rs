use std::sync::Arc;

use matlas::config::loader::{load_config, parse_config};
use matlas::config::manifest::{desired_state, load_apply_document, ApplyDocument, Manifest, DEFAULT_API_VERSION};
use matlas::config::validator::{validate, KindLimitValidator, NamingValidator, QuotaValidator, Validator};
use matlas::config::types::EngineConfig;
use matlas::engine::Engine;
use matlas::provider::memory::MemoryControlPlane;
use matlas::state::models::{DeletionPolicy, ResourceKind};
use serde_json::json;

fn cluster(name: &str) -> Manifest {
    Manifest::new(
        ResourceKind::Cluster,
        name,
        json!({"provider": "AWS", "region": "US_EAST_1", "instanceSize": "M10"}),
    )
}

fn document(resources: Vec<Manifest>) -> ApplyDocument {
    ApplyDocument {
        api_version: DEFAULT_API_VERSION.to_string(),
        project_id: "p1".to_string(),
        resources,
    }
}

// ─── Engine Config ───────────────────────────────────────────────────────────

#[test]
fn test_empty_config_is_default() {
    let config = parse_config("").unwrap();
    assert_eq!(config.executor.max_concurrent_operations, 5);
    assert!(!config.executor.preserve_existing);
    assert_eq!(config.cache.max_entries, EngineConfig::default().cache.max_entries);
}

#[test]
fn test_partial_config_keeps_other_defaults() {
    let yaml = r#"
executor:
  maxConcurrentOperations: 2
  preserveExisting: true
retry:
  kindProfiles:
    DatabaseUser: fast
idempotency:
  dedupWindowSecs: 60
"#;
    let config = parse_config(yaml).unwrap();
    assert_eq!(config.executor.max_concurrent_operations, 2);
    assert!(config.executor.preserve_existing);
    assert_eq!(config.executor.operation_timeout_secs, 30 * 60);
    assert_eq!(config.retry.profile_for(ResourceKind::DatabaseUser).max_attempts, 2);
    assert_eq!(config.retry.profile_for(ResourceKind::Cluster).max_attempts, 5);
    assert_eq!(config.idempotency.dedup_window_secs, 60);
    assert!(config.idempotency.enable_deduplication);
}

#[test]
fn test_malformed_config_is_an_error() {
    assert!(parse_config("executor: [1, 2").is_err());
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&dir.path().join("absent.yaml")).unwrap();
    assert!(config.recovery.enable_rollback);
    assert!(config.reconciliation.rules.len() > 1);
}

// ─── Structural Validation ───────────────────────────────────────────────────

#[test]
fn test_valid_manifests_pass() {
    let user = Manifest::new(
        ResourceKind::DatabaseUser,
        "app",
        json!({"username": "app", "authDatabase": "admin", "roles": []}),
    );
    let report = validate(&[cluster("c1"), user]);
    assert!(report.is_valid(), "{:?}", report.errors);
}

#[test]
fn test_bad_api_version_is_rejected() {
    let mut manifest = cluster("c1");
    manifest.api_version = "v1".to_string();
    let report = validate(&[manifest]);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("unsupported apiVersion"));
}

#[test]
fn test_empty_name_is_rejected() {
    let report = validate(&[cluster("  ")]);
    assert!(report.errors.iter().any(|e| e.contains("empty metadata.name")));
}

#[test]
fn test_duplicate_resources_are_rejected() {
    let report = validate(&[cluster("c1"), cluster("c1")]);
    assert!(report.errors.iter().any(|e| e.contains("Duplicate resource Cluster/c1")));
}

#[test]
fn test_unknown_dependency_is_rejected() {
    let mut manifest = cluster("c1");
    manifest.metadata.depends_on = vec!["Cluster/ghost".to_string()];
    let report = validate(&[manifest]);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("'Cluster/ghost', which does not exist"));
}

#[test]
fn test_bare_name_dependency_resolves() {
    let mut manifest = cluster("c2");
    manifest.metadata.depends_on = vec!["c1".to_string()];
    assert!(validate(&[cluster("c1"), manifest]).is_valid());
}

#[test]
fn test_spec_shape_is_checked() {
    let manifest = Manifest::new(ResourceKind::Cluster, "c1", json!({"provider": "AWS"}));
    let report = validate(&[manifest]);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("Invalid spec for Cluster 'c1'"));
}

#[test]
fn test_dependency_cycle_is_rejected() {
    let mut a = cluster("a");
    a.metadata.depends_on = vec!["b".to_string()];
    let mut b = cluster("b");
    b.metadata.depends_on = vec!["a".to_string()];
    let report = validate(&[a, b]);
    assert!(report.errors.iter().any(|e| e.starts_with("Dependency cycle detected: ")));
}

#[test]
fn test_role_must_be_named_after_role_name() {
    let role = Manifest::new(
        ResourceKind::DatabaseRole,
        "auditor",
        json!({"roleName": "reader", "databaseName": "app", "privileges": []}),
    );
    let report = validate(&[role]);
    assert!(report.errors[0].contains("must be named after its roleName 'reader'"));
}

#[test]
fn test_read_only_kind_cannot_be_declared() {
    let manifest = Manifest::new(ResourceKind::Alert, "a1", json!({}));
    let report = validate(&[manifest]);
    assert!(report.errors.iter().any(|e| e.contains("read-only")));
}

#[test]
fn test_report_lists_every_error() {
    let report = validate(&[cluster(""), cluster("x"), cluster("x")]);
    let err = report.into_result().unwrap_err().to_string();
    assert!(err.starts_with("Manifest validation failed with 2 error(s)"));
}

// ─── Pluggable Validators ────────────────────────────────────────────────────

#[test]
fn test_naming_validator() {
    let validator = Validator::new().with_content(Box::new(NamingValidator::new().unwrap()));
    assert!(validator.validate(&[cluster("prod-cluster.01")]).is_valid());

    let report = validator.validate(&[cluster("-bad name")]);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("must start with a letter or digit"));

    // Access list entries are named after addresses.
    let access = Manifest::new(ResourceKind::NetworkAccess, "10.0.0.0/24", json!({"cidrBlock": "10.0.0.0/24"}));
    assert!(validator.validate(&[access]).is_valid());
}

#[test]
fn test_kind_limit_validator() {
    let limit = KindLimitValidator {
        kind: ResourceKind::Cluster,
        max: 1,
    };
    let one = desired_state("p1", &[cluster("c1")]).unwrap();
    let report = tokio_test::block_on(limit.check("p1", &one)).unwrap();
    assert!(report.is_valid());
    assert_eq!(report.warnings.len(), 1);

    let two = desired_state("p1", &[cluster("c1"), cluster("c2")]).unwrap();
    let report = tokio_test::block_on(limit.check("p1", &two)).unwrap();
    assert!(report.errors[0].contains("above the limit of 1"));
}

#[tokio::test]
async fn test_engine_desired_state_enforces_validation() {
    let plane = MemoryControlPlane::new();
    let engine = Engine::new(plane.registry(), EngineConfig::default()).with_validator(
        Validator::new().with_quota(Arc::new(KindLimitValidator {
            kind: ResourceKind::Cluster,
            max: 1,
        })),
    );

    let desired = engine.desired_state("p1", &document(vec![cluster("c1")])).await.unwrap();
    assert!(desired.contains(ResourceKind::Cluster, "c1"));

    assert!(engine
        .desired_state("p1", &document(vec![cluster("c1"), cluster("c1")]))
        .await
        .is_err());
    assert!(engine
        .desired_state("p1", &document(vec![cluster("c1"), cluster("c2")]))
        .await
        .is_err());
}

// ─── Manifest Documents ──────────────────────────────────────────────────────

#[test]
fn test_load_yaml_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("project.yaml");
    std::fs::write(
        &path,
        r#"
apiVersion: matlas.mongodb.com/v1
projectId: p1
resources:
  - apiVersion: matlas.mongodb.com/v1
    kind: Cluster
    metadata:
      name: c1
      labels:
        env: prod
      deletionPolicy: snapshot
    spec:
      provider: AWS
      region: US_EAST_1
      instanceSize: M10
  - apiVersion: matlas.mongodb.com/v1
    kind: NetworkAccess
    metadata:
      name: office
      dependsOn: [Cluster/c1]
    spec:
      cidrBlock: 10.0.0.0/24
"#,
    )
    .unwrap();

    let doc = load_apply_document(&path).unwrap();
    assert_eq!(doc.project_id, "p1");
    assert_eq!(doc.resources.len(), 2);
    assert_eq!(doc.resources[0].metadata.deletion_policy, DeletionPolicy::Snapshot);

    let state = desired_state(&doc.project_id, &doc.resources).unwrap();
    let c1 = state.find(ResourceKind::Cluster, "c1").unwrap();
    assert_eq!(c1.metadata.labels["env"], "prod");
    assert_eq!(c1.spec["instanceSize"], "M10");
}

#[test]
fn test_load_json_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("project.json");
    let doc = json!({
        "apiVersion": DEFAULT_API_VERSION,
        "projectId": "p1",
        "resources": [{
            "apiVersion": DEFAULT_API_VERSION,
            "kind": "VPCEndpoint",
            "metadata": {"name": "pe1"},
            "spec": {"cloudProvider": "AWS", "region": "us-east-1"}
        }]
    });
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let loaded = load_apply_document(&path).unwrap();
    assert_eq!(loaded.resources[0].kind, ResourceKind::VpcEndpoint);
}

#[test]
fn test_unreadable_document_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.yaml");
    let err = load_apply_document(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("missing.yaml"));
}
