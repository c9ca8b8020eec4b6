use serde::{Deserialize, Serialize};
use std::fmt;

use super::drift::{Complexity, DriftType, ResourceDrift};
use crate::planner::plan::RiskLevel;
use crate::state::models::ResourceKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconcileAction {
    AutoFix,
    #[default]
    Warn,
    Prompt,
    Manual,
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileAction::AutoFix => "autoFix",
            ReconcileAction::Warn => "warn",
            ReconcileAction::Prompt => "prompt",
            ReconcileAction::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Chooses an action for drifts it matches. Empty kind or type lists match
/// everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconciliationRule {
    pub name: String,
    pub resource_kinds: Vec<ResourceKind>,
    pub drift_types: Vec<DriftType>,
    pub max_complexity: Complexity,
    pub action: ReconcileAction,
}

impl Default for ReconciliationRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            resource_kinds: Vec::new(),
            drift_types: Vec::new(),
            max_complexity: Complexity::Danger,
            action: ReconcileAction::Warn,
        }
    }
}

impl ReconciliationRule {
    fn new(name: &str, drift_types: &[DriftType], max_complexity: Complexity, action: ReconcileAction) -> Self {
        Self {
            name: name.to_string(),
            resource_kinds: Vec::new(),
            drift_types: drift_types.to_vec(),
            max_complexity,
            action,
        }
    }

    pub fn matches(&self, drift: &ResourceDrift) -> bool {
        (self.resource_kinds.is_empty() || self.resource_kinds.contains(&drift.resource_kind))
            && (self.drift_types.is_empty() || self.drift_types.contains(&drift.drift_type))
            && drift.complexity <= self.max_complexity
    }
}

pub fn default_rules() -> Vec<ReconciliationRule> {
    use DriftType::*;

    vec![
        ReconciliationRule::new("metadata-autofix", &[Metadata], Complexity::Simple, ReconcileAction::AutoFix),
        ReconciliationRule::new("security-manual", &[Security], Complexity::Danger, ReconcileAction::Manual),
        ReconciliationRule::new(
            "missing-or-unmanaged-prompt",
            &[Deleted, Created, Unexpected],
            Complexity::Danger,
            ReconcileAction::Prompt,
        ),
        ReconciliationRule::new("capacity-prompt", &[Scale, Structural], Complexity::Danger, ReconcileAction::Prompt),
        ReconciliationRule::new(
            "configuration-warn",
            &[Configuration, Network],
            Complexity::Moderate,
            ReconcileAction::Warn,
        ),
    ]
}

/// First matching rule decides; `fallback` applies when none match. Auto-fix
/// is downgraded to prompt for high-severity or complex drifts.
pub fn evaluate(
    rules: &[ReconciliationRule],
    fallback: ReconcileAction,
    drift: &ResourceDrift,
) -> (ReconcileAction, Option<String>) {
    let (action, rule) = rules
        .iter()
        .find(|rule| rule.matches(drift))
        .map(|rule| (rule.action, Some(rule.name.clone())))
        .unwrap_or((fallback, None));

    if action == ReconcileAction::AutoFix
        && (drift.severity >= RiskLevel::High || drift.complexity >= Complexity::Complex)
    {
        return (ReconcileAction::Prompt, rule);
    }
    (action, rule)
}
