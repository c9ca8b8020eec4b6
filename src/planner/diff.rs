use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::builder::build_operation_graph;
use crate::dag::resolver::resolve_stages;
use crate::planner::plan::{
    ChangeType, FieldChange, Impact, Operation, OperationType, Plan, PlannedOperation, RiskLevel,
};
use crate::state::models::{DeletionPolicy, ProjectState, Resource, ResourceKind};

/// Rendered in place of sensitive values.
pub const REDACTED: &str = "***";

// ─── Field Masks ────────────────────────────────────────────────────────────

/// Spec fields the diff engine does not compare for a kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMask {
    /// Server-managed fields.
    pub ignored: BTreeSet<String>,
    /// Accepted on write, never returned on read. Not compared, redacted in
    /// output, still fingerprinted.
    pub write_only: BTreeSet<String>,
}

const SERVER_MANAGED: &[&str] = &[
    "id",
    "createdAt",
    "updatedAt",
    "lastModified",
    "etag",
    "links",
];

impl FieldMask {
    pub fn for_kind(kind: ResourceKind) -> Self {
        let mut ignored: BTreeSet<String> = SERVER_MANAGED.iter().map(|s| s.to_string()).collect();
        let mut write_only = BTreeSet::new();
        match kind {
            ResourceKind::Cluster => {
                ignored.extend(
                    ["stateName", "connectionStrings", "mongoURI", "paused"]
                        .iter()
                        .map(|s| s.to_string()),
                );
            }
            ResourceKind::DatabaseUser => {
                write_only.insert("password".to_string());
            }
            ResourceKind::SearchIndex => {
                ignored.extend(["indexId", "status"].iter().map(|s| s.to_string()));
            }
            ResourceKind::VpcEndpoint => {
                ignored.extend(["status", "interfaceEndpoints"].iter().map(|s| s.to_string()));
            }
            _ => {}
        }
        Self { ignored, write_only }
    }

    pub fn skips(&self, field: &str) -> bool {
        self.ignored.contains(field) || self.write_only.contains(field)
    }

    /// Copy of a spec with write-only values replaced by the redaction marker.
    pub fn redact(&self, spec: &Value) -> Value {
        match spec {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        if self.write_only.contains(k) || is_sensitive(k) {
                            (k.clone(), Value::String(REDACTED.to_string()))
                        } else {
                            (k.clone(), self.redact(v))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }
}

fn is_sensitive(field: &str) -> bool {
    let lower = field.to_lowercase();
    lower.contains("password") || lower.contains("secret") || lower == "privatekey"
}

// ─── Diff Engine ────────────────────────────────────────────────────────────

/// Pairs desired and current resources and emits a staged plan.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    masks: BTreeMap<ResourceKind, FieldMask>,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl DiffEngine {
    /// Kinds missing from `masks` use [`FieldMask::for_kind`].
    pub fn new(masks: BTreeMap<ResourceKind, FieldMask>) -> Self {
        Self { masks }
    }

    pub fn mask(&self, kind: ResourceKind) -> FieldMask {
        self.masks
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| FieldMask::for_kind(kind))
    }

    /// Compute the plan converging `current` to `desired`.
    pub fn compute_plan(&self, desired: &ProjectState, current: &ProjectState) -> Result<Plan> {
        let operations = self.diff_operations(desired, current);
        self.stage_plan(&desired.project_id, operations)
    }

    /// Plan the removal of every desired resource that exists live.
    ///
    /// Resources with a `retain` deletion policy are left in place.
    pub fn compute_destroy_plan(&self, desired: &ProjectState, current: &ProjectState) -> Result<Plan> {
        let mut operations = Vec::new();
        for wanted in desired.resources() {
            if wanted.metadata.deletion_policy == DeletionPolicy::Retain {
                tracing::info!(
                    resource_kind = %wanted.kind,
                    resource_name = wanted.name(),
                    "Retaining resource on destroy"
                );
                continue;
            }
            if let Some(live) = current.find(wanted.kind, wanted.name()) {
                let mut live = live.clone();
                live.metadata.deletion_policy = wanted.metadata.deletion_policy;
                operations.push(self.delete_operation(&live));
            }
        }
        self.stage_plan(&desired.project_id, operations)
    }

    /// Unstaged operations, in kind order: desired resources first, then
    /// live resources that are no longer desired.
    pub fn diff_operations(&self, desired: &ProjectState, current: &ProjectState) -> Vec<Operation> {
        let mut operations = Vec::new();

        for kind in ResourceKind::MANAGED {
            let mask = self.mask(kind);
            for wanted in desired.resources_of(kind) {
                match current.find(kind, wanted.name()) {
                    None => operations.push(self.create_operation(wanted)),
                    Some(live) => {
                        let changes = diff_resource(wanted, live, &mask);
                        if changes.is_empty() {
                            operations.push(Operation {
                                op_type: OperationType::NoChange,
                                resource_kind: kind,
                                resource_name: wanted.name().to_string(),
                                current: Some(live.clone()),
                                desired: Some(wanted.clone()),
                                field_changes: Vec::new(),
                                impact: Impact::default(),
                                stage: 0,
                            });
                        } else if kind == ResourceKind::NetworkAccess {
                            // The backend cannot update access entries in place.
                            operations.push(self.delete_operation(live));
                            let mut create = self.create_operation(wanted);
                            create.current = None;
                            create.impact.risk_level = RiskLevel::High;
                            create.field_changes = changes;
                            operations.push(create);
                        } else {
                            let impact = update_impact(kind, &changes);
                            operations.push(Operation {
                                op_type: OperationType::Update,
                                resource_kind: kind,
                                resource_name: wanted.name().to_string(),
                                current: Some(live.clone()),
                                desired: Some(wanted.clone()),
                                field_changes: changes,
                                impact,
                                stage: 0,
                            });
                        }
                    }
                }
            }
        }

        for kind in ResourceKind::MANAGED {
            for live in current.resources_of(kind) {
                if !desired.contains(kind, live.name()) {
                    operations.push(self.delete_operation(live));
                }
            }
        }

        operations
    }

    fn create_operation(&self, desired: &Resource) -> Operation {
        Operation {
            op_type: OperationType::Create,
            resource_kind: desired.kind,
            resource_name: desired.name().to_string(),
            current: None,
            desired: Some(desired.clone()),
            field_changes: Vec::new(),
            impact: create_impact(desired.kind),
            stage: 0,
        }
    }

    fn delete_operation(&self, live: &Resource) -> Operation {
        Operation {
            op_type: OperationType::Delete,
            resource_kind: live.kind,
            resource_name: live.name().to_string(),
            current: Some(live.clone()),
            desired: None,
            field_changes: Vec::new(),
            impact: delete_impact(live.kind),
            stage: 0,
        }
    }

    /// Assign stages from the dependency graph and wrap into a plan.
    pub fn stage_plan(&self, project_id: &str, mut operations: Vec<Operation>) -> Result<Plan> {
        let graph = build_operation_graph(&operations);
        let stages = resolve_stages(&graph, |i| {
            let op = &operations[i];
            format!("{}/{}", op.resource_kind, op.resource_name)
        })?;
        for (op, stage) in operations.iter_mut().zip(&stages) {
            op.stage = *stage;
        }

        let mut planned: Vec<PlannedOperation> =
            operations.into_iter().map(PlannedOperation::new).collect();
        let ids: Vec<String> = planned.iter().map(|p| p.id.clone()).collect();
        for edge in graph.raw_edges() {
            let from = graph[edge.source()];
            let to = graph[edge.target()];
            planned[to].depends_on.push(ids[from].clone());
        }

        // Stable within a stage: original (kind) order.
        let mut indexed: Vec<(usize, PlannedOperation)> = planned.into_iter().enumerate().collect();
        indexed.sort_by_key(|(i, op)| (op.stage(), *i));
        let planned: Vec<PlannedOperation> = indexed.into_iter().map(|(_, op)| op).collect();

        let plan = Plan::new(project_id, planned);
        tracing::debug!(
            plan_id = %plan.id,
            project_id,
            operations = plan.operations.len(),
            max_stage = plan.max_stage,
            "Computed plan"
        );
        Ok(plan)
    }
}

// ─── Field Changes ──────────────────────────────────────────────────────────

/// Field-level changes turning `live` into `wanted`.
///
/// Labels are compared completely. The spec is compared desired-driven: keys
/// only present in the live resource are server-managed and ignored.
pub fn diff_resource(wanted: &Resource, live: &Resource, mask: &FieldMask) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    let keys: BTreeSet<&String> = wanted
        .metadata
        .labels
        .keys()
        .chain(live.metadata.labels.keys())
        .collect();
    for key in keys {
        let old = live.metadata.labels.get(key);
        let new = wanted.metadata.labels.get(key);
        let path = format!("metadata.labels.{}", key);
        match (old, new) {
            (None, Some(n)) => changes.push(FieldChange {
                path,
                old_value: None,
                new_value: Some(Value::String(n.clone())),
                change_type: ChangeType::Add,
            }),
            (Some(o), None) => changes.push(FieldChange {
                path,
                old_value: Some(Value::String(o.clone())),
                new_value: None,
                change_type: ChangeType::Remove,
            }),
            (Some(o), Some(n)) if o != n => changes.push(FieldChange {
                path,
                old_value: Some(Value::String(o.clone())),
                new_value: Some(Value::String(n.clone())),
                change_type: ChangeType::Modify,
            }),
            _ => {}
        }
    }

    diff_value("spec", &wanted.spec, &live.spec, mask, true, &mut changes);
    changes
}

fn diff_value(
    path: &str,
    wanted: &Value,
    live: &Value,
    mask: &FieldMask,
    top_level: bool,
    changes: &mut Vec<FieldChange>,
) {
    match (wanted, live) {
        (Value::Object(w), Value::Object(l)) => {
            let mut keys: Vec<&String> = w.keys().collect();
            keys.sort();
            for key in keys {
                if top_level && mask.skips(key) {
                    continue;
                }
                let child = format!("{}.{}", path, key);
                let wanted_value = &w[key.as_str()];
                match l.get(key.as_str()) {
                    None | Some(Value::Null) => {
                        if !wanted_value.is_null() {
                            changes.push(FieldChange {
                                old_value: None,
                                new_value: Some(redact_leaf(key, wanted_value)),
                                path: child,
                                change_type: ChangeType::Add,
                            });
                        }
                    }
                    Some(live_value) if wanted_value.is_null() => {
                        changes.push(FieldChange {
                            old_value: Some(redact_leaf(key, live_value)),
                            new_value: None,
                            path: child,
                            change_type: ChangeType::Remove,
                        });
                    }
                    Some(live_value) => {
                        diff_value(&child, wanted_value, live_value, mask, false, changes);
                    }
                }
            }
        }
        _ => {
            if !values_equal(wanted, live) {
                let leaf = path.rsplit('.').next().unwrap_or(path);
                changes.push(FieldChange {
                    path: path.to_string(),
                    old_value: Some(redact_leaf(leaf, live)),
                    new_value: Some(redact_leaf(leaf, wanted)),
                    change_type: ChangeType::Modify,
                });
            }
        }
    }
}

fn redact_leaf(field: &str, value: &Value) -> Value {
    if is_sensitive(field) {
        Value::String(REDACTED.to_string())
    } else {
        value.clone()
    }
}

/// Structural equality where numbers compare by value (`10` equals `10.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

// ─── Impact ─────────────────────────────────────────────────────────────────

fn is_security_kind(kind: ResourceKind) -> bool {
    matches!(
        kind,
        ResourceKind::NetworkAccess
            | ResourceKind::DatabaseUser
            | ResourceKind::DatabaseRole
            | ResourceKind::VpcEndpoint
    )
}

pub fn create_impact(kind: ResourceKind) -> Impact {
    let (risk_level, estimated_duration_ms) = match kind {
        ResourceKind::Cluster => (RiskLevel::Medium, 10 * 60 * 1_000),
        ResourceKind::Project => (RiskLevel::Low, 5_000),
        ResourceKind::VpcEndpoint => (RiskLevel::Medium, 5 * 60 * 1_000),
        k if is_security_kind(k) => (RiskLevel::Medium, 10_000),
        ResourceKind::SearchIndex => (RiskLevel::Low, 60_000),
        _ => (RiskLevel::Low, 5_000),
    };
    Impact {
        risk_level,
        is_destructive: false,
        requires_downtime: false,
        estimated_duration_ms,
    }
}

pub fn delete_impact(kind: ResourceKind) -> Impact {
    match kind {
        ResourceKind::Cluster | ResourceKind::Project => Impact {
            risk_level: RiskLevel::Critical,
            is_destructive: true,
            requires_downtime: true,
            estimated_duration_ms: 5 * 60 * 1_000,
        },
        k if is_security_kind(k) => Impact {
            risk_level: RiskLevel::High,
            is_destructive: true,
            requires_downtime: false,
            estimated_duration_ms: 10_000,
        },
        _ => Impact {
            risk_level: RiskLevel::Medium,
            is_destructive: true,
            requires_downtime: false,
            estimated_duration_ms: 10_000,
        },
    }
}

pub fn update_impact(kind: ResourceKind, changes: &[FieldChange]) -> Impact {
    let touches = |field: &str| {
        let prefix = format!("spec.{}", field);
        changes
            .iter()
            .any(|c| c.path == prefix || c.path.starts_with(&format!("{}.", prefix)))
    };
    let labels_only = changes.iter().all(|c| c.path.starts_with("metadata."));

    let mut impact = Impact {
        risk_level: RiskLevel::Low,
        is_destructive: false,
        requires_downtime: false,
        estimated_duration_ms: 5_000,
    };
    if labels_only {
        return impact;
    }

    if kind == ResourceKind::Cluster {
        impact.estimated_duration_ms = 5 * 60 * 1_000;
        impact.risk_level = RiskLevel::Medium;
        if touches("instanceSize") || touches("region") || touches("replicationSpecs") {
            impact.risk_level = RiskLevel::High;
        }
        if touches("region") || touches("replicationSpecs") {
            impact.requires_downtime = true;
        }
    } else if is_security_kind(kind) {
        impact.risk_level = RiskLevel::High;
        impact.estimated_duration_ms = 10_000;
    } else if kind == ResourceKind::SearchIndex {
        impact.risk_level = RiskLevel::Medium;
        impact.estimated_duration_ms = 60_000;
    }
    impact
}
