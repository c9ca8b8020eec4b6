//! In-memory control plane.
//!
//! Implements [`ResourceService`] for every mutable kind against a process-local
//! store, with fault injection for exercising retries and recovery. The CLI
//! persists it to a JSON snapshot between runs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::planner::diff::FieldMask;
use crate::provider::database::{DatabaseClient, DatabaseRoleHandler};
use crate::provider::registry::HandlerRegistry;
use crate::provider::service::{ResourceService, ServiceError, ServiceResponse};
use crate::state::models::{DatabaseRoleSpec, DeletionPolicy, Resource, ResourceKind};

/// Which service call a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultOp {
    Create,
    Update,
    Delete,
    List,
    Get,
}

/// An injected failure. Unset selectors match everything.
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: Option<ResourceKind>,
    pub name: Option<String>,
    pub op: Option<FaultOp>,
    pub error: ServiceError,
    /// `None` fails forever.
    pub remaining: Option<u32>,
}

impl Fault {
    pub fn new(error: ServiceError) -> Self {
        Self {
            kind: None,
            name: None,
            op: None,
            error,
            remaining: None,
        }
    }

    pub fn on(mut self, kind: ResourceKind, name: impl Into<String>) -> Self {
        self.kind = Some(kind);
        self.name = Some(name.into());
        self
    }

    pub fn on_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn during(mut self, op: FaultOp) -> Self {
        self.op = Some(op);
        self
    }

    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, kind: ResourceKind, name: Option<&str>, op: FaultOp) -> bool {
        self.kind.map_or(true, |k| k == kind)
            && self.op.map_or(true, |o| o == op)
            && match (&self.name, name) {
                (None, _) => true,
                (Some(wanted), Some(name)) => wanted == name,
                (Some(_), None) => false,
            }
    }
}

/// Serialized form of the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    #[serde(default)]
    pub projects: BTreeMap<String, Vec<Resource>>,
    /// Custom roles per connection string.
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<DatabaseRoleSpec>>,
    #[serde(default)]
    pub snapshots_taken: Vec<String>,
}

#[derive(Debug, Default)]
struct PlaneState {
    projects: BTreeMap<String, BTreeMap<(ResourceKind, String), Resource>>,
    roles: BTreeMap<String, BTreeMap<(String, String), DatabaseRoleSpec>>,
    faults: Vec<Fault>,
    mutations: u64,
    calls: u64,
    next_id: u64,
    snapshots_taken: Vec<String>,
}

impl PlaneState {
    fn take_fault(&mut self, kind: ResourceKind, name: Option<&str>, op: FaultOp) -> Option<ServiceError> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.matches(kind, name, op) && f.remaining != Some(0))?;
        let fault = &mut self.faults[idx];
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        Some(fault.error.clone())
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:024x}", self.next_id)
    }
}

/// Process-local control plane. Cloning shares the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryControlPlane {
    state: Arc<Mutex<PlaneState>>,
    latency: Option<Duration>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, so timeouts and cancellation can be observed.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Successful create/update/delete calls so far.
    pub fn mutation_count(&self) -> u64 {
        self.lock().mutations
    }

    /// Every service call so far, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.lock().calls
    }

    /// Addresses of resources snapshotted before deletion.
    pub fn snapshots_taken(&self) -> Vec<String> {
        self.lock().snapshots_taken.clone()
    }

    /// Place a resource directly into the store, bypassing faults and counters.
    pub fn seed(&self, project_id: &str, resource: Resource) {
        let mut state = self.lock();
        let mask = FieldMask::for_kind(resource.kind);
        let stored = stamp(&mut state, resource, &mask);
        state
            .projects
            .entry(project_id.to_string())
            .or_default()
            .insert((stored.kind, stored.name().to_string()), stored);
    }

    pub fn resource(&self, project_id: &str, kind: ResourceKind, name: &str) -> Option<Resource> {
        self.lock()
            .projects
            .get(project_id)
            .and_then(|p| p.get(&(kind, name.to_string())))
            .cloned()
    }

    pub fn resources(&self, project_id: &str) -> Vec<Resource> {
        self.lock()
            .projects
            .get(project_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A service handle for one kind.
    pub fn service(&self, kind: ResourceKind) -> Arc<dyn ResourceService> {
        Arc::new(MemoryService {
            plane: self.clone(),
            kind,
            mask: FieldMask::for_kind(kind),
        })
    }

    /// Registry with a handler for every managed kind. Custom roles go through
    /// the database-role handler with this plane as the database client.
    pub fn registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for kind in ResourceKind::MANAGED {
            if kind == ResourceKind::DatabaseRole {
                registry.register(Arc::new(DatabaseRoleHandler::from_env(Arc::new(self.clone()))));
            } else {
                registry.register(self.service(kind));
            }
        }
        registry
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let state = self.lock();
        MemorySnapshot {
            projects: state
                .projects
                .iter()
                .map(|(id, resources)| (id.clone(), resources.values().cloned().collect()))
                .collect(),
            roles: state
                .roles
                .iter()
                .map(|(conn, roles)| (conn.clone(), roles.values().cloned().collect()))
                .collect(),
            snapshots_taken: state.snapshots_taken.clone(),
        }
    }

    pub fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        let plane = Self::new();
        {
            let mut state = plane.lock();
            for (project_id, resources) in snapshot.projects {
                let entry = state.projects.entry(project_id).or_default();
                for resource in resources {
                    entry.insert((resource.kind, resource.name().to_string()), resource);
                }
            }
            for (conn, roles) in snapshot.roles {
                let entry = state.roles.entry(conn).or_default();
                for role in roles {
                    entry.insert((role.database_name.clone(), role.role_name.clone()), role);
                }
            }
            state.snapshots_taken = snapshot.snapshots_taken;
            let seeded: u64 = state.projects.values().map(|p| p.len() as u64).sum();
            state.next_id = seeded;
        }
        plane
    }

    /// Load from a JSON snapshot file. A missing file yields an empty plane.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let snapshot: MemorySnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write state file: {}", path.display()))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Count the call and surface any matching fault.
    fn begin(&self, kind: ResourceKind, name: Option<&str>, op: FaultOp) -> Result<(), ServiceError> {
        let mut state = self.lock();
        state.calls += 1;
        match state.take_fault(kind, name, op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Assign server-managed fields and drop write-only ones.
fn stamp(state: &mut PlaneState, mut resource: Resource, mask: &FieldMask) -> Resource {
    let id = state.next_id();
    if let serde_json::Value::Object(map) = &mut resource.spec {
        for field in &mask.write_only {
            map.remove(field);
        }
        map.entry("id").or_insert_with(|| serde_json::Value::String(id));
        map.insert(
            "createdAt".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );
        if resource.kind == ResourceKind::Cluster {
            map.insert("stateName".to_string(), serde_json::Value::String("IDLE".into()));
        }
    }
    resource.metadata.deletion_policy = DeletionPolicy::Delete;
    resource.metadata.depends_on.clear();
    resource
}

fn resource_id(resource: &Resource) -> Option<String> {
    resource.spec_str("id").map(|s| s.to_string())
}

/// Assigned id plus the lifecycle state, when the kind reports one.
fn response_for(stored: &Resource) -> ServiceResponse {
    let response = ServiceResponse {
        id: resource_id(stored),
        ..Default::default()
    };
    match stored.spec_str("stateName") {
        Some(state) => response.with_metadata("stateName", serde_json::Value::String(state.to_string())),
        None => response,
    }
}

struct MemoryService {
    plane: MemoryControlPlane,
    kind: ResourceKind,
    mask: FieldMask,
}

#[async_trait]
impl ResourceService for MemoryService {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn create(&self, project_id: &str, resource: &Resource) -> Result<ServiceResponse, ServiceError> {
        self.plane.simulate_latency().await;
        self.plane.begin(self.kind, Some(resource.name()), FaultOp::Create)?;

        let mut state = self.plane.lock();
        let key = (self.kind, resource.name().to_string());
        if state
            .projects
            .get(project_id)
            .is_some_and(|p| p.contains_key(&key))
        {
            return Err(ServiceError::conflict(self.kind, resource.name()));
        }
        let stored = stamp(&mut state, resource.clone(), &self.mask);
        let response = response_for(&stored);
        state
            .projects
            .entry(project_id.to_string())
            .or_default()
            .insert(key, stored);
        state.mutations += 1;

        Ok(response)
    }

    async fn update(&self, project_id: &str, resource: &Resource) -> Result<ServiceResponse, ServiceError> {
        self.plane.simulate_latency().await;
        self.plane.begin(self.kind, Some(resource.name()), FaultOp::Update)?;

        let mut state = self.plane.lock();
        let key = (self.kind, resource.name().to_string());
        let existing_id = state
            .projects
            .get(project_id)
            .and_then(|p| p.get(&key))
            .map(resource_id)
            .ok_or_else(|| ServiceError::not_found(self.kind, resource.name()))?;

        let mut updated = resource.clone();
        if let (Some(id), serde_json::Value::Object(map)) = (&existing_id, &mut updated.spec) {
            map.insert("id".to_string(), serde_json::Value::String(id.clone()));
        }
        let mut stored = stamp(&mut state, updated, &self.mask);
        if let serde_json::Value::Object(map) = &mut stored.spec {
            map.insert(
                "updatedAt".to_string(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }
        let response = response_for(&stored);
        state
            .projects
            .entry(project_id.to_string())
            .or_default()
            .insert(key, stored);
        state.mutations += 1;

        Ok(response)
    }

    async fn delete(&self, project_id: &str, resource: &Resource) -> Result<(), ServiceError> {
        self.plane.simulate_latency().await;
        self.plane.begin(self.kind, Some(resource.name()), FaultOp::Delete)?;

        let mut state = self.plane.lock();
        let key = (self.kind, resource.name().to_string());
        let removed = state
            .projects
            .get_mut(project_id)
            .and_then(|p| p.remove(&key));
        match removed {
            None => Err(ServiceError::not_found(self.kind, resource.name())),
            Some(_) => {
                if resource.metadata.deletion_policy == DeletionPolicy::Snapshot {
                    state
                        .snapshots_taken
                        .push(format!("{}/{}", self.kind, resource.name()));
                }
                state.mutations += 1;
                Ok(())
            }
        }
    }

    async fn list(&self, project_id: &str) -> Result<Vec<Resource>, ServiceError> {
        self.plane.simulate_latency().await;
        self.plane.begin(self.kind, None, FaultOp::List)?;

        let state = self.plane.lock();
        Ok(state
            .projects
            .get(project_id)
            .map(|p| {
                p.values()
                    .filter(|r| r.kind == self.kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, project_id: &str, name: &str) -> Result<Resource, ServiceError> {
        self.plane.simulate_latency().await;
        self.plane.begin(self.kind, Some(name), FaultOp::Get)?;

        self.plane
            .resource(project_id, self.kind, name)
            .ok_or_else(|| ServiceError::not_found(self.kind, name))
    }
}

// ─── Database Client ────────────────────────────────────────────────────────

#[async_trait]
impl DatabaseClient for MemoryControlPlane {
    async fn create_role(&self, connection: &str, role: &DatabaseRoleSpec) -> Result<(), ServiceError> {
        self.simulate_latency().await;
        self.begin(ResourceKind::DatabaseRole, Some(&role.role_name), FaultOp::Create)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let key = (role.database_name.clone(), role.role_name.clone());
        let roles = state.roles.entry(connection.to_string()).or_default();
        if roles.contains_key(&key) {
            return Err(ServiceError::conflict(ResourceKind::DatabaseRole, &role.role_name));
        }
        roles.insert(key, role.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn update_role(&self, connection: &str, role: &DatabaseRoleSpec) -> Result<(), ServiceError> {
        self.simulate_latency().await;
        self.begin(ResourceKind::DatabaseRole, Some(&role.role_name), FaultOp::Update)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let key = (role.database_name.clone(), role.role_name.clone());
        let roles = state.roles.entry(connection.to_string()).or_default();
        match roles.get_mut(&key) {
            None => Err(ServiceError::not_found(ResourceKind::DatabaseRole, &role.role_name)),
            Some(existing) => {
                *existing = role.clone();
                state.mutations += 1;
                Ok(())
            }
        }
    }

    async fn drop_role(&self, connection: &str, database: &str, role_name: &str) -> Result<(), ServiceError> {
        self.simulate_latency().await;
        self.begin(ResourceKind::DatabaseRole, Some(role_name), FaultOp::Delete)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let removed = state
            .roles
            .get_mut(connection)
            .and_then(|roles| roles.remove(&(database.to_string(), role_name.to_string())));
        match removed {
            None => Err(ServiceError::not_found(ResourceKind::DatabaseRole, role_name)),
            Some(_) => {
                state.mutations += 1;
                Ok(())
            }
        }
    }

    async fn list_roles(&self, connection: &str) -> Result<Vec<DatabaseRoleSpec>, ServiceError> {
        self.simulate_latency().await;
        self.begin(ResourceKind::DatabaseRole, None, FaultOp::List)?;
        Ok(self
            .lock()
            .roles
            .get(connection)
            .map(|roles| roles.values().cloned().collect())
            .unwrap_or_default())
    }
}
