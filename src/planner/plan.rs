use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::models::{Resource, ResourceKey, ResourceKind};

// ─── Operation Model ────────────────────────────────────────────────────────

/// The mutation an operation performs on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    Create,
    Update,
    Delete,
    NoChange,
}

impl OperationType {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, OperationType::NoChange)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            OperationType::Create => "+",
            OperationType::Update => "~",
            OperationType::Delete => "-",
            OperationType::NoChange => " ",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Create => write!(f, "Create"),
            OperationType::Update => write!(f, "Update"),
            OperationType::Delete => write!(f, "Delete"),
            OperationType::NoChange => write!(f, "NoChange"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Modify,
    Remove,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => write!(f, "add"),
            ChangeType::Modify => write!(f, "modify"),
            ChangeType::Remove => write!(f, "remove"),
        }
    }
}

/// One field-level delta inside an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Dotted path, e.g. `spec.instanceSize` or `metadata.labels.env`.
    pub path: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Impact {
    pub risk_level: RiskLevel,
    pub is_destructive: bool,
    pub requires_downtime: bool,
    pub estimated_duration_ms: u64,
}

/// A typed mutation against one resource, as produced by the diff engine.
///
/// Create has no `current`, Delete has no `desired`, Update and NoChange carry
/// both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub resource_kind: ResourceKind,
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Resource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_changes: Vec<FieldChange>,
    pub impact: Impact,
    pub stage: usize,
}

impl Operation {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_kind, self.resource_name.clone())
    }

    /// The resource this operation acts on: desired for create/update,
    /// current for delete.
    pub fn resource(&self) -> Option<&Resource> {
        match self.op_type {
            OperationType::Delete => self.current.as_ref(),
            _ => self.desired.as_ref().or(self.current.as_ref()),
        }
    }
}

// ─── Planned Operations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Skipped
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Skipped => "skipped",
            OperationStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// An operation scheduled inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedOperation {
    pub id: String,
    #[serde(flatten)]
    pub operation: Operation,
    pub status: OperationStatus,
    /// Ids of operations that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl PlannedOperation {
    pub fn new(operation: Operation) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            status: OperationStatus::Pending,
            depends_on: Vec::new(),
        }
    }

    pub fn op_type(&self) -> OperationType {
        self.operation.op_type
    }

    pub fn kind(&self) -> ResourceKind {
        self.operation.resource_kind
    }

    pub fn name(&self) -> &str {
        &self.operation.resource_name
    }

    pub fn stage(&self) -> usize {
        self.operation.stage
    }

    pub fn impact(&self) -> &Impact {
        &self.operation.impact
    }

    pub fn address(&self) -> String {
        format!("{}/{}", self.operation.resource_kind, self.operation.resource_name)
    }
}

// ─── Plan ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    #[default]
    Planning,
    Planned,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Planning => "planning",
            PlanStatus::Planned => "planned",
            PlanStatus::Executing => "executing",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// An ordered, staged set of operations converging one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub operations: Vec<PlannedOperation>,
    pub max_stage: usize,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Plan {
    pub fn new(project_id: impl Into<String>, operations: Vec<PlannedOperation>) -> Self {
        let max_stage = operations.iter().map(|op| op.stage()).max().unwrap_or(0);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            created_at: Utc::now(),
            operations,
            max_stage,
            status: PlanStatus::Planned,
            completed_at: None,
            last_error: None,
        }
    }

    /// Operations of one stage, in plan order.
    pub fn stage_operations(&self, stage: usize) -> impl Iterator<Item = &PlannedOperation> {
        self.operations.iter().filter(move |op| op.stage() == stage)
    }

    pub fn operation(&self, id: &str) -> Option<&PlannedOperation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match op.op_type() {
                OperationType::Create => summary.creates += 1,
                OperationType::Update => summary.updates += 1,
                OperationType::Delete => summary.deletes += 1,
                OperationType::NoChange => summary.no_changes += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(|op| op.op_type().is_mutation())
    }
}

/// Operation counts of a plan, by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub no_changes: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.creates > 0 {
            parts.push(format!("{} to add", self.creates));
        }
        if self.updates > 0 {
            parts.push(format!("{} to change", self.updates));
        }
        if self.deletes > 0 {
            parts.push(format!("{} to destroy", self.deletes));
        }
        if parts.is_empty() {
            write!(f, "No changes.")
        } else {
            write!(f, "Plan: {}.", parts.join(", "))
        }
    }
}
