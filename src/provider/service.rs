use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::models::{Resource, ResourceKind};

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Errors returned by a control-plane resource service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} '{name}' already exists")]
    Conflict { kind: ResourceKind, name: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ServiceError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        ServiceError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: ResourceKind, name: impl Into<String>) -> Self {
        ServiceError::Conflict {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::Conflict { .. })
    }

    /// Timeouts, throttling and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Timeout(_) | ServiceError::Throttled(_) => true,
            ServiceError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ServiceError::Unauthorized(_))
    }
}

/// Find a [`ServiceError`] anywhere in an error chain.
pub fn service_error(err: &anyhow::Error) -> Option<&ServiceError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ServiceError>())
}

fn message_contains(err: &anyhow::Error, needles: &[&str]) -> bool {
    let message = format!("{:#}", err).to_lowercase();
    needles.iter().any(|needle| message.contains(needle))
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    match service_error(err) {
        Some(e) => e.is_not_found(),
        None => message_contains(err, &["not found", "404", "does not exist"]),
    }
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    match service_error(err) {
        Some(e) => e.is_conflict(),
        None => message_contains(err, &["already exists", "conflict", "409", "duplicate"]),
    }
}

pub fn is_transient(err: &anyhow::Error) -> bool {
    match service_error(err) {
        Some(e) => e.is_transient(),
        None => message_contains(
            err,
            &[
                "timeout",
                "timed out",
                "connection reset",
                "connection refused",
                "temporarily unavailable",
                "too many requests",
                "429",
                "502",
                "503",
                "504",
            ],
        ),
    }
}

pub fn is_unauthorized(err: &anyhow::Error) -> bool {
    match service_error(err) {
        Some(e) => e.is_unauthorized(),
        None => message_contains(err, &["unauthorized", "forbidden", "401", "403"]),
    }
}

// ─── Service Contract ───────────────────────────────────────────────────────

/// What the backend reports after a successful mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ServiceResponse {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Typed CRUD surface for one resource kind of the control plane.
///
/// Implementations must be cancel-safe: the executor drops in-flight futures
/// when an operation times out or the plan is cancelled.
#[async_trait]
pub trait ResourceService: Send + Sync {
    /// The kind this service manages.
    fn kind(&self) -> ResourceKind;

    async fn create(&self, project_id: &str, resource: &Resource) -> Result<ServiceResponse, ServiceError>;

    async fn update(&self, project_id: &str, resource: &Resource) -> Result<ServiceResponse, ServiceError>;

    /// Delete the live resource. The resource's deletion policy is visible so
    /// services can take a final snapshot first.
    async fn delete(&self, project_id: &str, resource: &Resource) -> Result<(), ServiceError>;

    async fn list(&self, project_id: &str) -> Result<Vec<Resource>, ServiceError>;

    async fn get(&self, project_id: &str, name: &str) -> Result<Resource, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_predicates_win_over_message() {
        let err = anyhow::Error::new(ServiceError::Other("resource not found in cache".into()));
        assert!(!is_not_found(&err));

        let err = anyhow::Error::new(ServiceError::not_found(ResourceKind::Cluster, "c1"));
        assert!(is_not_found(&err));
    }

    #[test]
    fn untyped_errors_fall_back_to_message() {
        let err = anyhow::anyhow!("upstream said: 503 Service Temporarily Unavailable");
        assert!(is_transient(&err));
        assert!(!is_conflict(&err));

        let err = anyhow::anyhow!("user u1 already exists");
        assert!(is_conflict(&err));
    }

    #[test]
    fn context_does_not_hide_typed_error() {
        let err = anyhow::Error::new(ServiceError::Timeout("create cluster".into()))
            .context("Failed to create Cluster/c1");
        assert!(is_transient(&err));
        assert!(!is_unauthorized(&err));
    }

    #[test]
    fn server_errors_are_transient_only_for_5xx() {
        assert!(ServiceError::Server { status: 502, message: "bad gateway".into() }.is_transient());
        assert!(!ServiceError::Server { status: 400, message: "bad request".into() }.is_transient());
    }
}
