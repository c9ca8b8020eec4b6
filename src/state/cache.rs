use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::CacheConfig;
use crate::state::models::{ProjectState, ResourceKind};

/// Process-wide access counter. Orders LRU eviction independently of clock
/// resolution.
static ACCESS_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_access_seq() -> u64 {
    ACCESS_SEQ.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub state: ProjectState,
    pub cached_at: Instant,
    pub expires_at: Instant,
    pub accessed_at: Instant,
    pub hit_count: u64,
    pub last_access_seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evicts: u64,
    pub expires: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evicts: u64,
    expires: u64,
    last_cleanup: Option<DateTime<Utc>>,
}

impl CacheInner {
    /// Drop the least recently used entry. Ties on the access sequence fall
    /// back to the access time.
    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.last_access_seq
                    .cmp(&b.last_access_seq)
                    .then(a.accessed_at.cmp(&b.accessed_at))
            })
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&victim);
        self.evicts += 1;
        Some(victim)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - self.entries.len();
        self.expires += purged as u64;
        purged
    }
}

/// TTL + LRU cache of discovered project states, keyed by project id.
///
/// Cloning is cheap and clones share the same entries.
#[derive(Clone)]
pub struct StateCache {
    inner: Arc<RwLock<CacheInner>>,
    default_ttl: Duration,
    max_entries: usize,
    cleanup_interval: Duration,
    worker: Arc<Mutex<Option<(CancellationToken, JoinHandle<()>)>>>,
}

impl StateCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner::default())),
            default_ttl: config.default_ttl(),
            max_entries: config.max_entries.max(1),
            cleanup_interval: config.cleanup_interval(),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a project. Expired entries are evicted and reported as a miss.
    pub fn get(&self, project_id: &str) -> Option<ProjectState> {
        let now = Instant::now();
        let mut inner = self.write();

        let expired = match inner.entries.get(project_id) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            inner.entries.remove(project_id);
            inner.expires += 1;
            inner.misses += 1;
            tracing::debug!(project_id, "Cache entry expired");
            return None;
        }

        inner.hits += 1;
        let entry = inner.entries.get_mut(project_id)?;
        entry.accessed_at = now;
        entry.last_access_seq = next_access_seq();
        entry.hit_count += 1;
        Some(entry.state.clone())
    }

    /// Store a project state. A zero `ttl` means the default TTL.
    pub fn set(&self, project_id: &str, state: ProjectState, ttl: Duration) {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let now = Instant::now();
        let mut inner = self.write();

        if !inner.entries.contains_key(project_id) && inner.entries.len() >= self.max_entries {
            if let Some(victim) = inner.evict_lru() {
                tracing::debug!(project_id = %victim, "Evicted least recently used cache entry");
            }
        }

        inner.entries.insert(
            project_id.to_string(),
            CacheEntry {
                state,
                cached_at: now,
                expires_at: now + ttl,
                accessed_at: now,
                hit_count: 0,
                last_access_seq: next_access_seq(),
            },
        );
    }

    pub fn delete(&self, project_id: &str) -> bool {
        self.write().entries.remove(project_id).is_some()
    }

    pub fn clear(&self) {
        self.write().entries.clear();
    }

    pub fn contains(&self, project_id: &str) -> bool {
        self.read().entries.contains_key(project_id)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached project that holds resources of `kind`.
    pub fn invalidate_by_resource_kind(&self, kind: ResourceKind) -> usize {
        let mut inner = self.write();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| entry.state.resources_of(kind).is_empty());
        let dropped = before - inner.entries.len();
        if dropped > 0 {
            tracing::debug!(resource_kind = %kind, dropped, "Invalidated cache entries by kind");
        }
        dropped
    }

    /// Drop the cached state of the project a mutated resource belongs to.
    pub fn invalidate_by_resource(&self, project_id: &str, kind: ResourceKind, name: &str) -> bool {
        let removed = self.write().entries.remove(project_id).is_some();
        if removed {
            tracing::debug!(
                project_id,
                resource_kind = %kind,
                resource_name = name,
                "Invalidated cache entry after resource change"
            );
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.read();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            evicts: inner.evicts,
            expires: inner.expires,
            last_cleanup: inner.last_cleanup,
        }
    }

    /// Purge expired entries now. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let mut inner = self.write();
        let purged = inner.purge_expired(Instant::now());
        inner.last_cleanup = Some(Utc::now());
        purged
    }

    /// Start the background cleanup worker. Starting twice is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let child = token.clone();
        let cache = self.clone();
        let interval = self.cleanup_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let purged = cache.cleanup();
                        if purged > 0 {
                            tracing::debug!(purged, "Purged expired cache entries");
                        }
                    }
                }
            }
        });
        *worker = Some((token, handle));
    }

    /// Stop the cleanup worker and wait for it to exit.
    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = worker {
            token.cancel();
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
