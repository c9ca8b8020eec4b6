use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::planner::diff::FieldMask;
use crate::planner::plan::{Operation, OperationType};
use crate::provider::service::{ResourceService, ServiceError, ServiceResponse};
use crate::state::models::ResourceKind;

/// Everything the engine needs to manage one resource kind.
#[derive(Clone)]
pub struct KindHandler {
    pub service: Arc<dyn ResourceService>,
    pub mask: FieldMask,
}

impl std::fmt::Debug for KindHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindHandler")
            .field("kind", &self.service.kind())
            .field("mask", &self.mask)
            .finish()
    }
}

/// Maps each resource kind to its handler bundle.
///
/// Kinds without a handler (the search analysis kinds and alert instances)
/// are read-only; dispatching a mutation for them fails with
/// [`ServiceError::Unsupported`].
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ResourceKind, KindHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service using the default field mask of its kind.
    pub fn register(&mut self, service: Arc<dyn ResourceService>) {
        let kind = service.kind();
        self.register_with_mask(service, FieldMask::for_kind(kind));
    }

    pub fn register_with_mask(&mut self, service: Arc<dyn ResourceService>, mask: FieldMask) {
        let kind = service.kind();
        tracing::debug!(resource_kind = %kind, "Registered resource handler");
        self.handlers.insert(kind, KindHandler { service, mask });
    }

    pub fn with(mut self, service: Arc<dyn ResourceService>) -> Self {
        self.register(service);
        self
    }

    pub fn handler(&self, kind: ResourceKind) -> Result<&KindHandler, ServiceError> {
        self.handlers.get(&kind).ok_or_else(|| {
            ServiceError::Unsupported(format!("no handler registered for {}", kind))
        })
    }

    pub fn service(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceService>, ServiceError> {
        self.handler(kind).map(|h| Arc::clone(&h.service))
    }

    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds in dependency order.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        ResourceKind::MANAGED
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }

    /// Field masks of every registered kind, for the diff engine.
    pub fn masks(&self) -> BTreeMap<ResourceKind, FieldMask> {
        self.handlers
            .iter()
            .map(|(kind, handler)| (*kind, handler.mask.clone()))
            .collect()
    }

    /// Dispatch one operation to the handler for its kind.
    pub async fn dispatch(
        &self,
        project_id: &str,
        operation: &Operation,
    ) -> Result<ServiceResponse, ServiceError> {
        if operation.op_type == OperationType::NoChange {
            return Ok(ServiceResponse::default());
        }
        if !operation.resource_kind.is_managed() {
            return Err(ServiceError::Unsupported(format!(
                "{} is read-only and cannot be {}d",
                operation.resource_kind,
                operation.op_type.to_string().to_lowercase()
            )));
        }
        let handler = self.handler(operation.resource_kind)?;

        match operation.op_type {
            OperationType::Create => {
                let desired = required(operation, operation.desired.as_ref(), "desired")?;
                handler.service.create(project_id, desired).await
            }
            OperationType::Update => {
                let desired = required(operation, operation.desired.as_ref(), "desired")?;
                handler.service.update(project_id, desired).await
            }
            OperationType::Delete => {
                let current = required(operation, operation.current.as_ref(), "current")?;
                handler.service.delete(project_id, current).await?;
                Ok(ServiceResponse::default())
            }
            OperationType::NoChange => Ok(ServiceResponse::default()),
        }
    }
}

fn required<'a, T>(operation: &Operation, value: Option<&'a T>, what: &str) -> Result<&'a T, ServiceError> {
    value.ok_or_else(|| {
        ServiceError::Validation(format!(
            "{} of {}/{} has no {} resource",
            operation.op_type, operation.resource_kind, operation.resource_name, what
        ))
    })
}
