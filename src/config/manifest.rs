//! Already-parsed manifest documents and their conversion into desired state.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::state::models::{
    AlertConfigurationSpec, ClusterSpec, DatabaseRoleSpec, DatabaseUserSpec, DeletionPolicy,
    NetworkAccessSpec, ProjectSpec, ProjectState, Resource, ResourceKind, ResourceMetadata,
    SearchIndexSpec, TypedSpec, VpcEndpointSpec,
};

pub const API_VERSION_PREFIX: &str = "matlas.mongodb.com/";
pub const DEFAULT_API_VERSION: &str = "matlas.mongodb.com/v1";

/// Annotation carrying the connection string used for custom-role DDL.
pub const CONNECTION_STRING_ANNOTATION: &str = "matlas.mongodb.com/connection-string";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// One resource manifest. Immutable once handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub api_version: String,
    pub kind: ResourceKind,
    pub metadata: ManifestMetadata,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// A bundle of manifests targeting one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyDocument {
    pub api_version: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub resources: Vec<Manifest>,
}

impl Manifest {
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: serde_json::Value) -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            kind,
            metadata: ManifestMetadata {
                name: name.into(),
                ..Default::default()
            },
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Convert into a resource, checking that the spec has the shape its kind
    /// requires.
    pub fn to_resource(&self) -> Result<Resource> {
        let spec = match self.kind {
            ResourceKind::Project => normalize::<ProjectSpec>(&self.spec),
            ResourceKind::Cluster => normalize::<ClusterSpec>(&self.spec),
            ResourceKind::DatabaseUser => normalize::<DatabaseUserSpec>(&self.spec),
            ResourceKind::DatabaseRole => normalize::<DatabaseRoleSpec>(&self.spec),
            ResourceKind::NetworkAccess => normalize::<NetworkAccessSpec>(&self.spec),
            ResourceKind::SearchIndex => normalize::<SearchIndexSpec>(&self.spec),
            ResourceKind::VpcEndpoint => normalize::<VpcEndpointSpec>(&self.spec),
            ResourceKind::AlertConfiguration => normalize::<AlertConfigurationSpec>(&self.spec),
            other => bail!(
                "{} '{}' is read-only and cannot be declared in a manifest",
                other,
                self.metadata.name
            ),
        }
        .with_context(|| format!("Invalid spec for {} '{}'", self.kind, self.metadata.name))?;

        Ok(Resource {
            kind: self.kind,
            metadata: ResourceMetadata {
                name: self.metadata.name.clone(),
                labels: self.metadata.labels.clone(),
                annotations: self.metadata.annotations.clone(),
                deletion_policy: self.metadata.deletion_policy,
                depends_on: self.metadata.depends_on.clone(),
            },
            spec,
        })
    }
}

/// Round-trip a spec through its typed form so defaults are filled in and
/// shape errors surface before planning.
fn normalize<S: TypedSpec>(spec: &serde_json::Value) -> Result<serde_json::Value> {
    let typed: S = serde_json::from_value(spec.clone())?;
    Ok(serde_json::to_value(&typed)?)
}

/// Assemble the desired project state from manifests.
pub fn desired_state(project_id: &str, manifests: &[Manifest]) -> Result<ProjectState> {
    let mut state = ProjectState::new(project_id);
    for manifest in manifests {
        let resource = manifest.to_resource()?;
        if state.contains(resource.kind, resource.name()) {
            bail!(
                "Duplicate resource {}/{} in project '{}'",
                resource.kind,
                resource.name(),
                project_id
            );
        }
        state.push(resource)?;
    }
    Ok(state)
}

/// Read an apply document from a YAML or JSON file.
pub fn load_apply_document(path: &Path) -> Result<ApplyDocument> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;
    let is_json = path.extension().map(|e| e == "json").unwrap_or(false);
    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest JSON: {}", path.display()))
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest YAML: {}", path.display()))
    }
}
