use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

use super::manifest::{Manifest, API_VERSION_PREFIX};
use crate::dag::builder::build_resource_graph;
use crate::dag::resolver::resolve_stages;
use crate::state::models::{DatabaseRoleSpec, ProjectState, Resource, ResourceKind};

/// Problems found in a manifest set. Errors block planning; warnings do not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Fail with every error listed.
    pub fn into_result(self) -> Result<Vec<String>> {
        if !self.errors.is_empty() {
            bail!(
                "Manifest validation failed with {} error(s):\n  - {}",
                self.errors.len(),
                self.errors.join("\n  - ")
            );
        }
        Ok(self.warnings)
    }
}

/// Content-level checks on a single manifest.
pub trait ManifestValidator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, manifest: &Manifest, report: &mut ValidationReport);
}

/// Project-level limits, which may need to ask the control plane.
#[async_trait]
pub trait QuotaValidator: Send + Sync {
    async fn check(&self, project_id: &str, desired: &ProjectState) -> Result<ValidationReport>;
}

// ─── Structural Checks ──────────────────────────────────────────────────────

/// Run every structural check over a manifest set.
pub fn validate(manifests: &[Manifest]) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_api_versions(manifests, &mut report);
    validate_names(manifests, &mut report);
    validate_unique(manifests, &mut report);
    validate_depends_on(manifests, &mut report);
    let resources = validate_specs(manifests, &mut report);
    validate_no_cycles(&resources, &mut report);
    report
}

fn validate_api_versions(manifests: &[Manifest], report: &mut ValidationReport) {
    for manifest in manifests {
        if !manifest.api_version.starts_with(API_VERSION_PREFIX) {
            report.error(format!(
                "{} '{}' has unsupported apiVersion '{}' (expected {}*)",
                manifest.kind,
                manifest.name(),
                manifest.api_version,
                API_VERSION_PREFIX
            ));
        }
    }
}

fn validate_names(manifests: &[Manifest], report: &mut ValidationReport) {
    for manifest in manifests {
        if manifest.name().trim().is_empty() {
            report.error(format!("{} manifest has an empty metadata.name", manifest.kind));
        }
    }
}

fn validate_unique(manifests: &[Manifest], report: &mut ValidationReport) {
    let mut seen = HashSet::new();
    for manifest in manifests {
        if !seen.insert((manifest.kind, manifest.name())) {
            report.error(format!("Duplicate resource {}/{}", manifest.kind, manifest.name()));
        }
    }
}

/// `dependsOn` entries are `Kind/name` or a bare name of any kind.
fn validate_depends_on(manifests: &[Manifest], report: &mut ValidationReport) {
    let keys: HashSet<(ResourceKind, &str)> = manifests.iter().map(|m| (m.kind, m.name())).collect();
    let names: HashSet<&str> = manifests.iter().map(|m| m.name()).collect();

    for manifest in manifests {
        for dep in &manifest.metadata.depends_on {
            let exists = match dep.split_once('/') {
                Some((kind, name)) => match kind.parse::<ResourceKind>() {
                    Ok(kind) => keys.contains(&(kind, name)),
                    Err(_) => false,
                },
                None => names.contains(dep.as_str()),
            };
            if !exists {
                report.error(format!(
                    "{} '{}' depends on '{}', which does not exist",
                    manifest.kind,
                    manifest.name(),
                    dep
                ));
            }
        }
    }
}

/// Convert every manifest, reporting shape errors. Returns the resources
/// that converted.
fn validate_specs(manifests: &[Manifest], report: &mut ValidationReport) -> Vec<Resource> {
    let mut resources = Vec::with_capacity(manifests.len());
    for manifest in manifests {
        match manifest.to_resource() {
            Ok(resource) => {
                if resource.kind == ResourceKind::DatabaseRole {
                    if let Ok(role) = resource.typed_spec::<DatabaseRoleSpec>() {
                        if role.role_name != resource.name() {
                            report.error(format!(
                                "DatabaseRole '{}' must be named after its roleName '{}'",
                                resource.name(),
                                role.role_name
                            ));
                        }
                    }
                }
                resources.push(resource);
            }
            Err(e) => report.error(format!("{:#}", e)),
        }
    }
    resources
}

fn validate_no_cycles(resources: &[Resource], report: &mut ValidationReport) {
    let (graph, operations) = build_resource_graph(resources);
    if let Err(cycle) = resolve_stages(&graph, |i| {
        format!("{}/{}", operations[i].resource_kind, operations[i].resource_name)
    }) {
        report.error(cycle.to_string());
    }
}

// ─── Pluggable Validators ───────────────────────────────────────────────────

/// Structural checks plus registered content and quota validators.
#[derive(Default)]
pub struct Validator {
    content: Vec<Box<dyn ManifestValidator>>,
    quota: Vec<Arc<dyn QuotaValidator>>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(mut self, validator: Box<dyn ManifestValidator>) -> Self {
        self.content.push(validator);
        self
    }

    pub fn with_quota(mut self, validator: Arc<dyn QuotaValidator>) -> Self {
        self.quota.push(validator);
        self
    }

    pub fn validate(&self, manifests: &[Manifest]) -> ValidationReport {
        let mut report = validate(manifests);
        for validator in &self.content {
            for manifest in manifests {
                validator.validate(manifest, &mut report);
            }
        }
        tracing::debug!(
            manifests = manifests.len(),
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "Validated manifests"
        );
        report
    }

    pub async fn check_quotas(&self, project_id: &str, desired: &ProjectState) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        for validator in &self.quota {
            report.merge(validator.check(project_id, desired).await?);
        }
        Ok(report)
    }
}

/// Resource names the control plane accepts.
pub struct NamingValidator {
    pattern: Regex,
}

impl NamingValidator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$")?,
        })
    }
}

impl ManifestValidator for NamingValidator {
    fn name(&self) -> &str {
        "naming"
    }

    fn validate(&self, manifest: &Manifest, report: &mut ValidationReport) {
        let name = manifest.name();
        if name.is_empty() || manifest.kind == ResourceKind::NetworkAccess {
            return;
        }
        if !self.pattern.is_match(name) {
            report.error(format!(
                "{} name '{}' must start with a letter or digit and use only letters, digits, '.', '_' or '-' (max 64)",
                manifest.kind, name
            ));
        }
    }
}

/// Caps the number of resources of one kind per project.
pub struct KindLimitValidator {
    pub kind: ResourceKind,
    pub max: usize,
}

#[async_trait]
impl QuotaValidator for KindLimitValidator {
    async fn check(&self, project_id: &str, desired: &ProjectState) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let count = desired.resources_of(self.kind).len();
        if count > self.max {
            report.error(format!(
                "Project '{}' declares {} {} resources, above the limit of {}",
                project_id, count, self.kind, self.max
            ));
        } else if count == self.max {
            report.warn(format!("Project '{}' is at its {} limit ({})", project_id, self.kind, self.max));
        }
        Ok(report)
    }
}
