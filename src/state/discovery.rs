use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use crate::config::types::DiscoveryConfig;
use crate::provider::registry::HandlerRegistry;
use crate::state::cache::StateCache;
use crate::state::fingerprint::FingerprintEngine;
use crate::state::models::{ProjectState, Resource, ResourceKind};

/// Reads the live state of a project from the control plane.
#[async_trait]
pub trait StateDiscovery: Send + Sync {
    /// Discover every managed kind of a project.
    async fn discover_project(&self, project_id: &str) -> Result<ProjectState>;

    /// Discover the resources of one kind.
    async fn discover_kind(&self, project_id: &str, kind: ResourceKind) -> Result<Vec<Resource>>;

    async fn discover_clusters(&self, project_id: &str) -> Result<Vec<Resource>> {
        self.discover_kind(project_id, ResourceKind::Cluster).await
    }

    async fn discover_database_users(&self, project_id: &str) -> Result<Vec<Resource>> {
        self.discover_kind(project_id, ResourceKind::DatabaseUser).await
    }

    async fn discover_network_access(&self, project_id: &str) -> Result<Vec<Resource>> {
        self.discover_kind(project_id, ResourceKind::NetworkAccess).await
    }

    async fn discover_search_indexes(&self, project_id: &str) -> Result<Vec<Resource>> {
        self.discover_kind(project_id, ResourceKind::SearchIndex).await
    }

    async fn discover_project_settings(&self, project_id: &str) -> Result<Option<Resource>> {
        Ok(self
            .discover_kind(project_id, ResourceKind::Project)
            .await?
            .into_iter()
            .next())
    }
}

// ─── Rate Limiting ──────────────────────────────────────────────────────────

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiting request rate. A non-positive rate disables limiting.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate: requests_per_second,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        if self.rate <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// ─── Control-Plane Discovery ────────────────────────────────────────────────

/// Discovery backed by the registered resource services, fanning out one
/// list call per kind.
pub struct ControlPlaneDiscovery {
    registry: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    limiter: Arc<TokenBucket>,
    fingerprints: FingerprintEngine,
}

impl ControlPlaneDiscovery {
    pub fn new(registry: Arc<HandlerRegistry>, config: &DiscoveryConfig, fingerprints: FingerprintEngine) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            limiter: Arc::new(TokenBucket::new(config.requests_per_second, config.burst)),
            fingerprints,
        }
    }
}

#[async_trait]
impl StateDiscovery for ControlPlaneDiscovery {
    async fn discover_project(&self, project_id: &str) -> Result<ProjectState> {
        let started = Instant::now();
        let kinds = self.registry.kinds();

        let mut handles = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let registry = Arc::clone(&self.registry);
            let semaphore = Arc::clone(&self.semaphore);
            let limiter = Arc::clone(&self.limiter);
            let project = project_id.to_string();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("Discovery semaphore closed")?;
                limiter.acquire().await;
                let service = registry.service(kind)?;
                let resources = service
                    .list(&project)
                    .await
                    .with_context(|| format!("Failed to discover {} in project '{}'", kind, project))?;
                Ok::<_, anyhow::Error>((kind, resources))
            }));
        }

        let listed = futures::future::try_join_all(handles)
            .await
            .context("Discovery task panicked")?;
        let mut state = ProjectState::new(project_id);
        for outcome in listed {
            let (kind, resources) = outcome?;
            state.set_resources(kind, resources)?;
        }
        state.fingerprint = self.fingerprints.fingerprint_state(&state)?;

        tracing::info!(
            project_id,
            resources = state.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Discovered project state"
        );
        Ok(state)
    }

    async fn discover_kind(&self, project_id: &str, kind: ResourceKind) -> Result<Vec<Resource>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("Discovery semaphore closed")?;
        self.limiter.acquire().await;
        let service = self.registry.service(kind)?;
        service
            .list(project_id)
            .await
            .with_context(|| format!("Failed to discover {} in project '{}'", kind, project_id))
    }
}

// ─── Cached Discovery ───────────────────────────────────────────────────────

/// Consults the state cache before discovering a whole project.
pub struct CachedStateDiscovery {
    inner: Arc<dyn StateDiscovery>,
    cache: StateCache,
}

impl CachedStateDiscovery {
    pub fn new(inner: Arc<dyn StateDiscovery>, cache: StateCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }
}

#[async_trait]
impl StateDiscovery for CachedStateDiscovery {
    async fn discover_project(&self, project_id: &str) -> Result<ProjectState> {
        if let Some(state) = self.cache.get(project_id) {
            tracing::debug!(project_id, "Using cached project state");
            return Ok(state);
        }
        let state = self.inner.discover_project(project_id).await?;
        self.cache.set(project_id, state.clone(), Duration::ZERO);
        Ok(state)
    }

    async fn discover_kind(&self, project_id: &str, kind: ResourceKind) -> Result<Vec<Resource>> {
        self.inner.discover_kind(project_id, kind).await
    }
}
