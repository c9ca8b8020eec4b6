use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::rules::ReconcileAction;
use crate::planner::plan::{FieldChange, Operation, OperationType, Plan, RiskLevel};
use crate::state::fingerprint::FingerprintEngine;
use crate::state::models::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DriftType {
    Configuration,
    Scale,
    Security,
    Network,
    Metadata,
    Structural,
    /// Live content changed in a way no field-level rule explains.
    Unexpected,
    /// Declared but missing from the live project.
    Deleted,
    /// Present live but not declared.
    Created,
}

impl fmt::Display for DriftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriftType::Configuration => "configuration",
            DriftType::Scale => "scale",
            DriftType::Security => "security",
            DriftType::Network => "network",
            DriftType::Metadata => "metadata",
            DriftType::Structural => "structural",
            DriftType::Unexpected => "unexpected",
            DriftType::Deleted => "deleted",
            DriftType::Created => "created",
        };
        f.write_str(s)
    }
}

/// Effort and risk of converging a drift, ordered from least to most.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
    Danger,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
            Complexity::Danger => "danger",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDrift {
    pub id: String,
    pub resource_kind: ResourceKind,
    pub resource_name: String,
    pub drift_type: DriftType,
    pub severity: RiskLevel,
    pub complexity: Complexity,
    pub field_changes: Vec<FieldChange>,
    /// The operation that converges the drift.
    pub operation: Operation,
    /// Delete half of a replace, for kinds that cannot be updated in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companion: Option<Operation>,
    pub auto_fix: bool,
    pub action: ReconcileAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Identifies the same drift across detections.
    pub fingerprint: String,
    pub detected_at: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub occurrences: u32,
}

impl ResourceDrift {
    pub fn address(&self) -> String {
        format!("{}/{}", self.resource_kind, self.resource_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftDetectionResult {
    pub project_id: String,
    pub detected_at: DateTime<Utc>,
    pub drifts: Vec<ResourceDrift>,
    /// The converging plan the drifts were read from.
    pub plan: Plan,
    pub current_fingerprint: String,
}

impl DriftDetectionResult {
    pub fn has_drift(&self) -> bool {
        !self.drifts.is_empty()
    }

    pub fn counts_by_type(&self) -> BTreeMap<DriftType, usize> {
        let mut counts = BTreeMap::new();
        for drift in &self.drifts {
            *counts.entry(drift.drift_type).or_insert(0) += 1;
        }
        counts
    }

    pub fn auto_fixable(&self) -> impl Iterator<Item = &ResourceDrift> {
        self.drifts.iter().filter(|d| d.auto_fix)
    }
}

// ─── Classification ─────────────────────────────────────────────────────────

/// Field-name keywords per drift type, most significant first.
const PATH_KEYWORDS: &[(DriftType, &[&str])] = &[
    (
        DriftType::Security,
        &[
            "security", "auth", "authdatabase", "password", "roles", "rolename", "privileges", "actions",
            "inheritedroles", "x509type", "ldapauthtype", "awsiamtype", "encryption", "scopes",
        ],
    ),
    (
        DriftType::Network,
        &[
            "network", "ip", "ipaddress", "cidr", "cidrblock", "awssecuritygroup", "vpc", "endpoint",
            "endpointservicename", "peering", "accesslist",
        ],
    ),
    (
        DriftType::Scale,
        &[
            "instance", "instancesize", "size", "disksizegb", "scale", "autoscaling", "nodecount",
            "electablenodes", "readonlynodes", "analyticsnodes",
        ],
    ),
    (
        DriftType::Structural,
        &[
            "replicationspecs", "region", "regionname", "provider", "providername", "cloudprovider",
            "clustertype", "numshards", "mongodbversion", "definition", "mappings", "indextype",
        ],
    ),
];

const METADATA_KEYWORDS: &[&str] = &["metadata", "labels", "label", "tags", "tag", "annotations", "comment"];

/// Drift type of one changed field path.
pub fn classify_path(path: &str) -> DriftType {
    let segments: Vec<String> = path.split('.').map(|s| s.to_lowercase()).collect();
    if segments.first().is_some_and(|s| s == "metadata") {
        return DriftType::Metadata;
    }
    for (drift_type, keywords) in PATH_KEYWORDS {
        if segments.iter().any(|seg| keywords.contains(&seg.as_str())) {
            return *drift_type;
        }
    }
    if segments.iter().any(|seg| METADATA_KEYWORDS.contains(&seg.as_str())) {
        return DriftType::Metadata;
    }
    DriftType::Configuration
}

fn rank(drift_type: DriftType) -> usize {
    match drift_type {
        DriftType::Security => 0,
        DriftType::Network => 1,
        DriftType::Scale => 2,
        DriftType::Structural => 3,
        DriftType::Configuration => 4,
        DriftType::Metadata => 5,
        DriftType::Unexpected | DriftType::Deleted | DriftType::Created => 6,
    }
}

/// Drift type of a converging operation. A missing resource reads as
/// deleted out of band, an undeclared one as created out of band.
pub fn classify_operation(op: &Operation) -> DriftType {
    match op.op_type {
        OperationType::Create if op.field_changes.is_empty() => DriftType::Deleted,
        OperationType::Delete => DriftType::Created,
        _ => op
            .field_changes
            .iter()
            .map(|c| classify_path(&c.path))
            .min_by_key(|t| rank(*t))
            .unwrap_or(DriftType::Unexpected),
    }
}

pub fn assess_complexity(op: &Operation, drift_type: DriftType) -> Complexity {
    match drift_type {
        DriftType::Deleted | DriftType::Created if op.resource_kind == ResourceKind::Cluster => Complexity::Danger,
        DriftType::Deleted | DriftType::Created => Complexity::Complex,
        _ if op.impact.requires_downtime || op.impact.is_destructive => Complexity::Danger,
        DriftType::Security | DriftType::Structural => Complexity::Complex,
        DriftType::Metadata if op.field_changes.len() <= 2 => Complexity::Simple,
        _ if op.field_changes.len() <= 3 => Complexity::Moderate,
        _ => Complexity::Complex,
    }
}

/// Content identity of a drift: resource, type and the exact changes.
pub fn drift_fingerprint(engine: &FingerprintEngine, op: &Operation, drift_type: DriftType) -> String {
    let value = json!({
        "name": op.resource_name,
        "driftType": drift_type,
        "changes": op.field_changes,
    });
    engine.fingerprint_value(&value, op.resource_kind)
}

/// Pair up the operations of a converging plan into drift candidates,
/// folding delete+create replacements into one entry.
pub fn drift_candidates(plan: &Plan) -> Vec<(Operation, Option<Operation>)> {
    let replaced: Vec<(ResourceKind, String)> = plan
        .operations
        .iter()
        .filter(|op| op.op_type() == OperationType::Create && !op.operation.field_changes.is_empty())
        .map(|op| (op.kind(), op.name().to_string()))
        .collect();

    let mut candidates = Vec::new();
    for planned in &plan.operations {
        let op = &planned.operation;
        let key = (op.resource_kind, op.resource_name.clone());
        match op.op_type {
            OperationType::NoChange => {}
            OperationType::Delete if replaced.contains(&key) => {}
            OperationType::Create if replaced.contains(&key) => {
                let companion = plan
                    .operations
                    .iter()
                    .find(|p| p.op_type() == OperationType::Delete && p.kind() == key.0 && p.name() == key.1)
                    .map(|p| p.operation.clone());
                candidates.push((op.clone(), companion));
            }
            _ => candidates.push((op.clone(), None)),
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_path_priorities() {
        assert_eq!(classify_path("metadata.labels.env"), DriftType::Metadata);
        assert_eq!(classify_path("spec.password"), DriftType::Security);
        assert_eq!(classify_path("spec.roles"), DriftType::Security);
        assert_eq!(classify_path("spec.cidrBlock"), DriftType::Network);
        assert_eq!(classify_path("spec.instanceSize"), DriftType::Scale);
        assert_eq!(classify_path("spec.region"), DriftType::Structural);
        assert_eq!(classify_path("spec.backupEnabled"), DriftType::Configuration);
        assert_eq!(classify_path("spec.comment"), DriftType::Metadata);
    }

    #[test]
    fn test_description_is_not_network() {
        assert_eq!(classify_path("spec.description"), DriftType::Configuration);
    }
}
