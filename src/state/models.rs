use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ─── Resource Kinds ─────────────────────────────────────────────────────────

/// Every kind of resource the control plane knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Project,
    Cluster,
    DatabaseUser,
    DatabaseRole,
    NetworkAccess,
    SearchIndex,
    SearchMetrics,
    SearchOptimization,
    SearchQueryValidation,
    #[serde(rename = "VPCEndpoint")]
    VpcEndpoint,
    AlertConfiguration,
    Alert,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 12] = [
        ResourceKind::Project,
        ResourceKind::Cluster,
        ResourceKind::DatabaseUser,
        ResourceKind::DatabaseRole,
        ResourceKind::NetworkAccess,
        ResourceKind::SearchIndex,
        ResourceKind::SearchMetrics,
        ResourceKind::SearchOptimization,
        ResourceKind::SearchQueryValidation,
        ResourceKind::VpcEndpoint,
        ResourceKind::AlertConfiguration,
        ResourceKind::Alert,
    ];

    /// Kinds that can be created, updated and deleted through the control plane.
    pub const MANAGED: [ResourceKind; 8] = [
        ResourceKind::Project,
        ResourceKind::Cluster,
        ResourceKind::DatabaseUser,
        ResourceKind::DatabaseRole,
        ResourceKind::NetworkAccess,
        ResourceKind::SearchIndex,
        ResourceKind::VpcEndpoint,
        ResourceKind::AlertConfiguration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Project => "Project",
            ResourceKind::Cluster => "Cluster",
            ResourceKind::DatabaseUser => "DatabaseUser",
            ResourceKind::DatabaseRole => "DatabaseRole",
            ResourceKind::NetworkAccess => "NetworkAccess",
            ResourceKind::SearchIndex => "SearchIndex",
            ResourceKind::SearchMetrics => "SearchMetrics",
            ResourceKind::SearchOptimization => "SearchOptimization",
            ResourceKind::SearchQueryValidation => "SearchQueryValidation",
            ResourceKind::VpcEndpoint => "VPCEndpoint",
            ResourceKind::AlertConfiguration => "AlertConfiguration",
            ResourceKind::Alert => "Alert",
        }
    }

    /// Analysis and alert-instance kinds are observed, never mutated.
    pub fn is_managed(&self) -> bool {
        Self::MANAGED.contains(self)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .with_context(|| format!("Unknown resource kind '{}'", s))
    }
}

/// Identity of a resource within a project: (kind, name) is unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// ─── Resource Envelope ──────────────────────────────────────────────────────

/// What happens to the live resource when its manifest is destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Retain,
    Snapshot,
}

fn is_default_policy(policy: &DeletionPolicy) -> bool {
    *policy == DeletionPolicy::Delete
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "is_default_policy")]
    pub deletion_policy: DeletionPolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// A single resource, desired or live. The spec is kept as a JSON document so
/// diffing and fingerprinting work uniformly across kinds; typed views are
/// available through [`Resource::typed_spec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub metadata: ResourceMetadata,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl Resource {
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: serde_json::Value) -> Self {
        Self {
            kind,
            metadata: ResourceMetadata {
                name: name.into(),
                ..Default::default()
            },
            spec,
        }
    }

    /// Build a resource from one of the typed spec structs.
    pub fn from_spec<S: TypedSpec>(name: impl Into<String>, spec: &S) -> Result<Self> {
        let value = serde_json::to_value(spec)
            .with_context(|| format!("Failed to serialize {} spec", S::KIND))?;
        Ok(Self::new(S::KIND, name, value))
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_depends_on(mut self, target: impl Into<String>) -> Self {
        self.metadata.depends_on.push(target.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.metadata.name.clone())
    }

    /// Deserialize the spec into its typed form.
    pub fn typed_spec<S: TypedSpec>(&self) -> Result<S> {
        if self.kind != S::KIND {
            bail!(
                "Resource '{}' is a {}, not a {}",
                self.metadata.name,
                self.kind,
                S::KIND
            );
        }
        serde_json::from_value(self.spec.clone())
            .with_context(|| format!("Invalid {} spec for '{}'", self.kind, self.metadata.name))
    }

    /// The cluster a search index or endpoint is bound to, if any.
    pub fn cluster_name(&self) -> Option<&str> {
        self.spec.get("clusterName").and_then(|v| v.as_str())
    }

    /// A string field from the spec.
    pub fn spec_str(&self, field: &str) -> Option<&str> {
        self.spec.get(field).and_then(|v| v.as_str())
    }
}

// ─── Typed Specs ────────────────────────────────────────────────────────────

/// Ties a spec struct to its resource kind.
pub trait TypedSpec: Serialize + DeserializeOwned {
    const KIND: ResourceKind;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
}

impl TypedSpec for ProjectSpec {
    const KIND: ResourceKind = ResourceKind::Project;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub provider: String,
    pub region: String,
    pub instance_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongodb_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replication_specs: Vec<serde_json::Value>,
}

impl TypedSpec for ClusterSpec {
    const KIND: ResourceKind = ResourceKind::Cluster;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    pub role_name: String,
    pub database_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserScope {
    pub name: String,
    #[serde(rename = "type")]
    pub scope_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUserSpec {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_auth_database")]
    pub auth_database: String,
    #[serde(default)]
    pub roles: Vec<RoleAssignment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<UserScope>,
}

fn default_auth_database() -> String {
    "admin".to_string()
}

impl TypedSpec for DatabaseUserSpec {
    const KIND: ResourceKind = ResourceKind::DatabaseUser;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivilegeResource {
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Privilege {
    pub actions: Vec<String>,
    pub resource: PrivilegeResource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InheritedRole {
    pub role_name: String,
    pub database_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRoleSpec {
    pub role_name: String,
    pub database_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub privileges: Vec<Privilege>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherited_roles: Vec<InheritedRole>,
}

impl TypedSpec for DatabaseRoleSpec {
    const KIND: ResourceKind = ResourceKind::DatabaseRole;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAccessSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr_block: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_security_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after_date: Option<String>,
}

impl TypedSpec for NetworkAccessSpec {
    const KIND: ResourceKind = ResourceKind::NetworkAccess;
}

/// Search index definitions are forwarded to the backend untouched; analyzer
/// and synonym shapes depend on the backend API version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchIndexSpec {
    pub cluster_name: String,
    pub database: String,
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(default = "default_index_type", rename = "type")]
    pub index_type: String,
    #[serde(default)]
    pub definition: serde_json::Value,
}

fn default_index_type() -> String {
    "search".to_string()
}

impl TypedSpec for SearchIndexSpec {
    const KIND: ResourceKind = ResourceKind::SearchIndex;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcEndpointSpec {
    pub cloud_provider: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_service_name: Option<String>,
}

impl TypedSpec for VpcEndpointSpec {
    const KIND: ResourceKind = ResourceKind::VpcEndpoint;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertConfigurationSpec {
    pub event_type_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl TypedSpec for AlertConfigurationSpec {
    const KIND: ResourceKind = ResourceKind::AlertConfiguration;
}

// ─── Project State ──────────────────────────────────────────────────────────

/// Aggregate state of one project, either desired (from manifests) or live
/// (from discovery).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub project_id: String,
    #[serde(default)]
    pub project: Option<Resource>,
    #[serde(default)]
    pub clusters: Vec<Resource>,
    #[serde(default)]
    pub database_users: Vec<Resource>,
    #[serde(default)]
    pub database_roles: Vec<Resource>,
    #[serde(default)]
    pub network_access: Vec<Resource>,
    #[serde(default)]
    pub search_indexes: Vec<Resource>,
    #[serde(default)]
    pub vpc_endpoints: Vec<Resource>,
    #[serde(default)]
    pub alert_configurations: Vec<Resource>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub fingerprint: String,
}

impl ProjectState {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            project: None,
            clusters: Vec::new(),
            database_users: Vec::new(),
            database_roles: Vec::new(),
            network_access: Vec::new(),
            search_indexes: Vec::new(),
            vpc_endpoints: Vec::new(),
            alert_configurations: Vec::new(),
            discovered_at: Utc::now(),
            fingerprint: String::new(),
        }
    }

    /// Add a resource to the sequence for its kind.
    pub fn push(&mut self, resource: Resource) -> Result<()> {
        match resource.kind {
            ResourceKind::Project => self.project = Some(resource),
            ResourceKind::Cluster => self.clusters.push(resource),
            ResourceKind::DatabaseUser => self.database_users.push(resource),
            ResourceKind::DatabaseRole => self.database_roles.push(resource),
            ResourceKind::NetworkAccess => self.network_access.push(resource),
            ResourceKind::SearchIndex => self.search_indexes.push(resource),
            ResourceKind::VpcEndpoint => self.vpc_endpoints.push(resource),
            ResourceKind::AlertConfiguration => self.alert_configurations.push(resource),
            other => bail!(
                "{} '{}' is read-only and cannot be part of a project state",
                other,
                resource.metadata.name
            ),
        }
        Ok(())
    }

    pub fn with(mut self, resource: Resource) -> Result<Self> {
        self.push(resource)?;
        Ok(self)
    }

    /// Resources of one kind, in their stored order.
    pub fn resources_of(&self, kind: ResourceKind) -> &[Resource] {
        match kind {
            ResourceKind::Project => self.project.as_slice(),
            ResourceKind::Cluster => &self.clusters,
            ResourceKind::DatabaseUser => &self.database_users,
            ResourceKind::DatabaseRole => &self.database_roles,
            ResourceKind::NetworkAccess => &self.network_access,
            ResourceKind::SearchIndex => &self.search_indexes,
            ResourceKind::VpcEndpoint => &self.vpc_endpoints,
            ResourceKind::AlertConfiguration => &self.alert_configurations,
            _ => &[],
        }
    }

    /// Replace the sequence for one kind (used by discovery fan-in).
    pub fn set_resources(&mut self, kind: ResourceKind, resources: Vec<Resource>) -> Result<()> {
        match kind {
            ResourceKind::Project => self.project = resources.into_iter().next(),
            ResourceKind::Cluster => self.clusters = resources,
            ResourceKind::DatabaseUser => self.database_users = resources,
            ResourceKind::DatabaseRole => self.database_roles = resources,
            ResourceKind::NetworkAccess => self.network_access = resources,
            ResourceKind::SearchIndex => self.search_indexes = resources,
            ResourceKind::VpcEndpoint => self.vpc_endpoints = resources,
            ResourceKind::AlertConfiguration => self.alert_configurations = resources,
            other => bail!("{} is read-only and is not tracked in project state", other),
        }
        Ok(())
    }

    /// All resources, grouped by kind in dependency order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        ResourceKind::MANAGED
            .into_iter()
            .flat_map(move |kind| self.resources_of(kind).iter())
    }

    pub fn find(&self, kind: ResourceKind, name: &str) -> Option<&Resource> {
        self.resources_of(kind).iter().find(|r| r.metadata.name == name)
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.find(kind, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.resources().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Idempotency Records ────────────────────────────────────────────────────

/// Tracked lifecycle of one planned operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    pub id: String,
    pub plan_id: String,
    pub status: crate::planner::plan::OperationStatus,
    pub resource_kind: ResourceKind,
    /// Resource name within the project.
    pub resource_id: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
    #[serde(default)]
    pub checkpoint_data: BTreeMap<String, serde_json::Value>,
    /// Includes `projectID` and `operationType`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

pub const META_PROJECT_ID: &str = "projectID";
pub const META_OPERATION_TYPE: &str = "operationType";

impl OperationState {
    pub fn project_id(&self) -> Option<&str> {
        self.metadata.get(META_PROJECT_ID).map(|s| s.as_str())
    }

    pub fn operation_type(&self) -> Option<&str> {
        self.metadata.get(META_OPERATION_TYPE).map(|s| s.as_str())
    }
}

/// Exclusive, time-bounded right of one plan to mutate one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOwnership {
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub owner_plan_id: String,
    pub owner_op_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResourceOwnership {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Pre/post-execution context of an operation, enabling rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub operation_id: String,
    pub plan_id: String,
    /// `pre-execution`, `post-execution`, `post-execution-failed` or `autofix`.
    pub stage: String,
    pub created_at: DateTime<Utc>,
    pub data: serde_json::Value,
    /// The resource as it was before the mutation, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_state: Option<Resource>,
}
