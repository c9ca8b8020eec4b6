use std::sync::Arc;

use async_trait::async_trait;

use crate::config::manifest::CONNECTION_STRING_ANNOTATION;
use crate::provider::service::{ResourceService, ServiceError, ServiceResponse};
use crate::state::models::{DatabaseRoleSpec, Resource, ResourceKind};

/// Fallback source of the connection string for custom-role DDL.
pub const CONNECTION_STRING_ENV: &str = "MATLAS_CONNECTION_STRING";

/// DDL surface of the database itself. Custom roles live in the database,
/// not in the control plane.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn create_role(&self, connection: &str, role: &DatabaseRoleSpec) -> Result<(), ServiceError>;

    async fn update_role(&self, connection: &str, role: &DatabaseRoleSpec) -> Result<(), ServiceError>;

    async fn drop_role(&self, connection: &str, database: &str, role_name: &str) -> Result<(), ServiceError>;

    async fn list_roles(&self, connection: &str) -> Result<Vec<DatabaseRoleSpec>, ServiceError>;
}

/// Resource service for `DatabaseRole`, executing DDL through a database
/// client.
pub struct DatabaseRoleHandler {
    client: Arc<dyn DatabaseClient>,
    default_connection: Option<String>,
}

impl DatabaseRoleHandler {
    pub fn new(client: Arc<dyn DatabaseClient>, default_connection: Option<String>) -> Self {
        Self {
            client,
            default_connection,
        }
    }

    /// Use `MATLAS_CONNECTION_STRING` as the default connection.
    pub fn from_env(client: Arc<dyn DatabaseClient>) -> Self {
        let default_connection = std::env::var(CONNECTION_STRING_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty());
        Self::new(client, default_connection)
    }

    /// The annotation wins over the default connection.
    pub fn connection_for(&self, resource: &Resource) -> Result<String, ServiceError> {
        resource
            .metadata
            .annotations
            .get(CONNECTION_STRING_ANNOTATION)
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .or_else(|| self.default_connection.clone())
            .ok_or_else(|| {
                ServiceError::Validation(format!(
                    "DatabaseRole '{}' needs a connection string: set the '{}' annotation or {}",
                    resource.name(),
                    CONNECTION_STRING_ANNOTATION,
                    CONNECTION_STRING_ENV
                ))
            })
    }

    fn role_spec(resource: &Resource) -> Result<DatabaseRoleSpec, ServiceError> {
        resource
            .typed_spec::<DatabaseRoleSpec>()
            .map_err(|e| ServiceError::Validation(format!("{:#}", e)))
    }

    fn to_resource(role: &DatabaseRoleSpec, connection: &str) -> Result<Resource, ServiceError> {
        Resource::from_spec(role.role_name.clone(), role)
            .map(|r| r.with_annotation(CONNECTION_STRING_ANNOTATION, connection))
            .map_err(|e| ServiceError::Other(format!("{:#}", e)))
    }
}

#[async_trait]
impl ResourceService for DatabaseRoleHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::DatabaseRole
    }

    async fn create(&self, _project_id: &str, resource: &Resource) -> Result<ServiceResponse, ServiceError> {
        let connection = self.connection_for(resource)?;
        let role = Self::role_spec(resource)?;
        self.client.create_role(&connection, &role).await?;
        tracing::info!(role = %role.role_name, database = %role.database_name, "Created custom role");
        Ok(ServiceResponse::with_id(format!("{}.{}", role.database_name, role.role_name)))
    }

    async fn update(&self, _project_id: &str, resource: &Resource) -> Result<ServiceResponse, ServiceError> {
        let connection = self.connection_for(resource)?;
        let role = Self::role_spec(resource)?;
        self.client.update_role(&connection, &role).await?;
        Ok(ServiceResponse::with_id(format!("{}.{}", role.database_name, role.role_name)))
    }

    async fn delete(&self, _project_id: &str, resource: &Resource) -> Result<(), ServiceError> {
        let connection = self.connection_for(resource)?;
        let role = Self::role_spec(resource)?;
        self.client
            .drop_role(&connection, &role.database_name, &role.role_name)
            .await
    }

    /// Roles reachable through the default connection, named by role name.
    /// Without a default connection nothing can be listed.
    async fn list(&self, _project_id: &str) -> Result<Vec<Resource>, ServiceError> {
        let Some(connection) = &self.default_connection else {
            tracing::debug!("No default connection string, skipping custom role discovery");
            return Ok(Vec::new());
        };
        self.client
            .list_roles(connection)
            .await?
            .iter()
            .map(|role| Self::to_resource(role, connection))
            .collect()
    }

    async fn get(&self, project_id: &str, name: &str) -> Result<Resource, ServiceError> {
        self.list(project_id)
            .await?
            .into_iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| ServiceError::not_found(ResourceKind::DatabaseRole, name))
    }
}
