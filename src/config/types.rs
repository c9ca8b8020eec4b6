use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::planner::plan::OperationType;
use crate::reconcile::rules::{default_rules, ReconcileAction, ReconciliationRule};
use crate::recovery::manager::RecoveryStrategy;
use crate::state::models::ResourceKind;

// ─── Top-Level Config ───────────────────────────────────────────────────────

/// Root configuration for the reconciliation engine. Every section and field
/// has a default, so an empty document is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub discovery: DiscoveryConfig,
    pub fingerprint: FingerprintConfig,
    pub idempotency: IdempotencyConfig,
    pub recovery: RecoveryConfig,
    pub reconciliation: ReconciliationConfig,
    pub progress: ProgressConfig,
}

// ─── Executor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutorConfig {
    pub max_concurrent_operations: usize,
    pub operation_timeout_secs: u64,
    /// Treat a conflict on create as "resource already there, keep it".
    pub preserve_existing: bool,
    /// Kinds whose operations may run concurrently within a stage.
    pub parallel_safe_kinds: Vec<ResourceKind>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 5,
            operation_timeout_secs: 30 * 60,
            preserve_existing: false,
            parallel_safe_kinds: vec![
                ResourceKind::DatabaseUser,
                ResourceKind::DatabaseRole,
                ResourceKind::NetworkAccess,
                ResourceKind::SearchIndex,
                ResourceKind::VpcEndpoint,
                ResourceKind::AlertConfiguration,
            ],
        }
    }
}

impl ExecutorConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn is_parallel_safe(&self, kind: ResourceKind) -> bool {
        self.parallel_safe_kinds.contains(&kind)
    }
}

// ─── Retry ──────────────────────────────────────────────────────────────────

/// Backoff parameters for one class of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryProfile {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Wall-clock ceiling across all attempts.
    pub max_elapsed_ms: u64,
    /// Upper bound of the uniform jitter factor.
    pub max_jitter: f64,
}

impl Default for RetryProfile {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_elapsed_ms: 5 * 60 * 1_000,
            max_jitter: 0.25,
        }
    }
}

impl RetryProfile {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub default_profile: String,
    pub profiles: BTreeMap<String, RetryProfile>,
    /// Profile name per resource kind; kinds not listed use the default profile.
    pub kind_profiles: BTreeMap<ResourceKind, String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("default".to_string(), RetryProfile::default());
        profiles.insert(
            "cluster".to_string(),
            RetryProfile {
                max_attempts: 5,
                base_delay_ms: 5_000,
                max_delay_ms: 120_000,
                max_elapsed_ms: 30 * 60 * 1_000,
                max_jitter: 0.25,
            },
        );
        profiles.insert(
            "fast".to_string(),
            RetryProfile {
                max_attempts: 2,
                base_delay_ms: 200,
                max_delay_ms: 2_000,
                max_elapsed_ms: 30_000,
                max_jitter: 0.25,
            },
        );

        let mut kind_profiles = BTreeMap::new();
        kind_profiles.insert(ResourceKind::Cluster, "cluster".to_string());

        Self {
            default_profile: "default".to_string(),
            profiles,
            kind_profiles,
        }
    }
}

impl RetryConfig {
    /// Resolve the retry profile for a resource kind.
    pub fn profile_for(&self, kind: ResourceKind) -> RetryProfile {
        self.kind_profiles
            .get(&kind)
            .and_then(|name| self.profiles.get(name))
            .or_else(|| self.profiles.get(&self.default_profile))
            .cloned()
            .unwrap_or_default()
    }

    /// Use one profile for every kind (handy for tests and one-off runs).
    pub fn uniform(profile: RetryProfile) -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("default".to_string(), profile);
        Self {
            default_profile: "default".to_string(),
            profiles,
            kind_profiles: BTreeMap::new(),
        }
    }
}

// ─── State Cache & Discovery ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub max_entries: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 5 * 60,
            max_entries: 100,
            cleanup_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Simultaneous fan-out calls.
    pub max_concurrency: usize,
    /// Token-bucket refill rate.
    pub requests_per_second: f64,
    /// Token-bucket capacity.
    pub burst: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            requests_per_second: 10.0,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FingerprintConfig {
    pub ignore_metadata_fields: Vec<String>,
    /// When non-empty, only these top-level fields are hashed.
    pub include_fields: Vec<String>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            ignore_metadata_fields: ["createdAt", "updatedAt", "lastModified", "etag"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            include_fields: Vec::new(),
        }
    }
}

// ─── Idempotency & Recovery ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdempotencyConfig {
    pub enable_deduplication: bool,
    pub state_ttl_secs: u64,
    pub ownership_ttl_secs: u64,
    pub dedup_window_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_checkpoints_per_operation: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enable_deduplication: true,
            state_ttl_secs: 24 * 60 * 60,
            ownership_ttl_secs: 30 * 60,
            dedup_window_secs: 60 * 60,
            cleanup_interval_secs: 5 * 60,
            max_checkpoints_per_operation: 10,
        }
    }
}

impl IdempotencyConfig {
    pub fn state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.state_ttl_secs as i64)
    }

    pub fn ownership_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ownership_ttl_secs as i64)
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryConfig {
    pub enable_rollback: bool,
    pub enable_cleanup: bool,
    /// Re-dispatch attempts made by the retry strategy.
    pub max_recovery_attempts: u32,
    pub retry_delay_ms: u64,
    /// Overrides the strategy table for every failure of an operation type.
    pub operation_strategies: BTreeMap<OperationType, RecoveryStrategy>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enable_rollback: true,
            enable_cleanup: true,
            max_recovery_attempts: 1,
            retry_delay_ms: 1_000,
            operation_strategies: BTreeMap::new(),
        }
    }
}

// ─── Reconciliation & Progress ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconciliationConfig {
    /// Evaluated in order; the first matching rule decides the action.
    pub rules: Vec<ReconciliationRule>,
    pub default_action: ReconcileAction,
    pub schedule_interval_secs: u64,
    /// Execute auto-fixed drifts through the executor instead of only
    /// recording them.
    pub apply_fixes: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            default_action: ReconcileAction::Warn,
            schedule_interval_secs: 60 * 60,
            apply_fixes: false,
        }
    }
}

impl ReconciliationConfig {
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgressConfig {
    pub update_interval_ms: u64,
    pub event_buffer: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 500,
            event_buffer: 100,
        }
    }
}

impl ProgressConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.max(1))
    }
}
