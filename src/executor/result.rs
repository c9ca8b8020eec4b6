use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::planner::plan::{OperationStatus, PlanStatus};
use crate::provider::service::ServiceError;

/// Failure taxonomy shared by the executor and the recovery manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Network,
    Timeout,
    Authentication,
    Quota,
    Conflict,
    Validation,
    Dependency,
    ResourceState,
    Internal,
}

impl ErrorType {
    /// Recoverable failures may succeed on a later attempt or after recovery.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorType::Network
                | ErrorType::Timeout
                | ErrorType::Conflict
                | ErrorType::Dependency
                | ErrorType::ResourceState
        )
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorType::Network => "network",
            ErrorType::Timeout => "timeout",
            ErrorType::Authentication => "authentication",
            ErrorType::Quota => "quota",
            ErrorType::Conflict => "conflict",
            ErrorType::Validation => "validation",
            ErrorType::Dependency => "dependency",
            ErrorType::ResourceState => "resourceState",
            ErrorType::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl From<&ServiceError> for ErrorType {
    fn from(err: &ServiceError) -> Self {
        match err {
            ServiceError::Timeout(_) => ErrorType::Timeout,
            ServiceError::Throttled(_) => ErrorType::Network,
            ServiceError::Server { status, .. } if *status >= 500 => ErrorType::Network,
            ServiceError::Server { .. } => ErrorType::Internal,
            ServiceError::Unauthorized(_) => ErrorType::Authentication,
            ServiceError::Quota(_) => ErrorType::Quota,
            ServiceError::Conflict { .. } => ErrorType::Conflict,
            ServiceError::Validation(_) | ServiceError::Unsupported(_) => ErrorType::Validation,
            ServiceError::NotFound { .. } => ErrorType::ResourceState,
            ServiceError::Cancelled => ErrorType::Internal,
            ServiceError::Other(_) => ErrorType::Internal,
        }
    }
}

/// Structured record of one failed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub operation_id: String,
    pub message: String,
    pub error_type: ErrorType,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

impl ExecutionError {
    pub fn new(operation_id: impl Into<String>, message: impl Into<String>, error_type: ErrorType) -> Self {
        Self {
            operation_id: operation_id.into(),
            message: message.into(),
            error_type,
            timestamp: Utc::now(),
            recoverable: error_type.is_recoverable(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

/// Outcome of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub operation_id: String,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Attempts made, including the first.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Handler-reported details and notes such as "already deleted".
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl OperationResult {
    pub fn note(&self) -> Option<&str> {
        self.metadata.get("note").and_then(|v| v.as_str())
    }

    pub fn with_note(mut self, note: &str) -> Self {
        self.metadata
            .insert("note".to_string(), serde_json::Value::String(note.to_string()));
        self
    }

    pub fn retried(&self) -> bool {
        self.attempts > 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub total: usize,
    /// Includes skipped operations.
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Operations that needed more than one attempt.
    pub retried: usize,
    /// Never dispatched (later stages after a fatal error or cancellation).
    pub pending: usize,
}

impl fmt::Display for ExecutionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} completed, {} failed, {} skipped",
            self.total, self.completed, self.failed, self.skipped
        )?;
        if self.retried > 0 {
            write!(f, ", {} retried", self.retried)?;
        }
        if self.pending > 0 {
            write!(f, ", {} not started", self.pending)?;
        }
        Ok(())
    }
}

/// Outcome of a whole plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub plan_id: String,
    pub status: PlanStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Keyed by operation id.
    pub operation_results: BTreeMap<String, OperationResult>,
    pub errors: Vec<ExecutionError>,
    pub summary: ExecutionSummary,
}

impl ExecutionResult {
    pub fn result(&self, operation_id: &str) -> Option<&OperationResult> {
        self.operation_results.get(operation_id)
    }

    pub fn is_success(&self) -> bool {
        self.status == PlanStatus::Completed
    }
}
