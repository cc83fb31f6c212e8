//! SAP connector
//!
//! Ties the credential resolver, the service catalog and the OData client
//! together behind the operations exposed to the agent.

use crate::auth::CredentialResolver;
use crate::catalog::{CatalogError, ServiceCatalog, ServiceDescriptor};
use crate::config::RuntimeConfig;
use crate::error::ConnectorError;
use crate::odata::{normalize, OutputFormat, QueryOptions, SapClient};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// Parameters of a `query` call
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub service: String,
    pub entity_set: String,
    pub options: QueryOptions,
    pub format: OutputFormat,
}

/// Successful `get_entity` result
#[derive(Debug, Clone, Serialize)]
pub struct EntityResult {
    pub success: bool,
    pub service: String,
    pub entity_set: String,
    pub entity_key: String,
    pub key_field: String,
    pub data: Value,
}

/// Successful `list_services` result
#[derive(Debug, Clone, Serialize)]
pub struct ServiceList {
    pub success: bool,
    pub count: usize,
    pub services: Vec<ServiceDescriptor>,
    pub source: String,
}

/// Successful `authenticate` result
#[derive(Debug, Clone, Serialize)]
pub struct AuthResult {
    pub success: bool,
    pub message: String,
    pub host: String,
    pub client: String,
}

/// SAP Gateway connector. Owns at most one [`SapClient`] (and with it one
/// session), created on first use.
pub struct SapConnector {
    resolver: Arc<CredentialResolver>,
    runtime: RuntimeConfig,
    catalog: RwLock<Arc<ServiceCatalog>>,
    client: Mutex<Option<Arc<SapClient>>>,
}

impl SapConnector {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        catalog: ServiceCatalog,
        runtime: RuntimeConfig,
    ) -> Self {
        Self {
            resolver,
            runtime,
            catalog: RwLock::new(Arc::new(catalog)),
            client: Mutex::new(None),
        }
    }

    /// Current catalog snapshot
    pub fn catalog(&self) -> Arc<ServiceCatalog> {
        match self.catalog.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-read the catalog from the file it came from. The current catalog
    /// stays in place if the new one fails to load.
    pub fn reload_catalog(&self) -> Result<Arc<ServiceCatalog>, CatalogError> {
        let current = self.catalog();
        let path = current
            .source()
            .map(|p| p.to_path_buf())
            .or_else(|| self.runtime.catalog_path.clone());

        let fresh = Arc::new(ServiceCatalog::discover(path.as_deref())?);
        match self.catalog.write() {
            Ok(mut guard) => *guard = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
        Ok(fresh)
    }

    /// Lazily resolve credentials and build the shared client
    async fn client(&self) -> Result<Arc<SapClient>, ConnectorError> {
        let mut slot = self.client.lock().await;
        if let Some(ref client) = *slot {
            return Ok(client.clone());
        }

        let credentials = self.resolver.resolve(false).await?;
        tracing::info!(
            "Connecting to SAP Gateway {} (client {})",
            credentials.host,
            credentials.client
        );

        let client = Arc::new(SapClient::new(credentials, &self.runtime)?);
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Close the session. The next call opens a new one.
    pub async fn shutdown(&self) {
        if let Some(client) = self.client.lock().await.take() {
            client.close().await;
        }
    }

    fn find_service(&self, service: &str) -> Result<ServiceDescriptor, ConnectorError> {
        let catalog = self.catalog();
        catalog
            .get(service)
            .cloned()
            .ok_or_else(|| ConnectorError::ServiceNotFound {
                service: service.to_string(),
                available: catalog.list_ids(),
            })
    }

    pub fn list_services(&self) -> ServiceList {
        let catalog = self.catalog();
        let source = catalog
            .source()
            .map(|p| format!("{} configuration", p.display()))
            .unwrap_or_else(|| "services.yaml configuration".to_string());

        ServiceList {
            success: true,
            count: catalog.len(),
            services: catalog.services().to_vec(),
            source,
        }
    }

    /// Query an entity set of a catalog service
    pub async fn query(&self, request: &QueryRequest) -> Result<Value, ConnectorError> {
        let service = self.find_service(&request.service)?;

        // Services that declare no entity sets accept any name
        if !service.entities.is_empty() && service.get_entity(&request.entity_set).is_none() {
            return Err(ConnectorError::EntityNotFound {
                service: request.service.clone(),
                entity_set: request.entity_set.clone(),
                available: service.entity_names().iter().map(|s| s.to_string()).collect(),
            });
        }

        let client = self.client().await?;
        let envelope = client
            .query_entity_set(&service.path, &request.entity_set, &request.options)
            .await?;

        Ok(normalize(envelope, request.format))
    }

    /// Fetch one entity by key
    pub async fn get_entity(
        &self,
        service: &str,
        entity_set: &str,
        entity_key: &str,
        select: Option<&[String]>,
    ) -> Result<EntityResult, ConnectorError> {
        let descriptor = self.find_service(service)?;
        let entity = descriptor
            .get_entity(entity_set)
            .cloned()
            .ok_or_else(|| ConnectorError::EntityNotFound {
                service: service.to_string(),
                entity_set: entity_set.to_string(),
                available: descriptor.entity_names().iter().map(|s| s.to_string()).collect(),
            })?;

        if entity_key.trim().is_empty() {
            return Err(ConnectorError::InvalidArgument(
                "entity_key must not be empty".to_string(),
            ));
        }

        let client = self.client().await?;
        let data = client
            .get_entity(
                &descriptor.path,
                entity_set,
                entity_key,
                entity.key_kind,
                select,
            )
            .await?;

        Ok(EntityResult {
            success: true,
            service: service.to_string(),
            entity_set: entity_set.to_string(),
            entity_key: entity_key.to_string(),
            key_field: entity.key_field,
            data,
        })
    }

    /// Run the CSRF handshake against the configured gateway
    pub async fn authenticate(&self) -> Result<AuthResult, ConnectorError> {
        let client = self.client().await?;
        if !client.authenticate().await? {
            return Err(crate::odata::ODataError::AuthenticationFailed(
                "SAP Gateway rejected the credentials".to_string(),
            )
            .into());
        }

        let credentials = client.session().credentials();
        Ok(AuthResult {
            success: true,
            message: "Successfully authenticated with SAP Gateway".to_string(),
            host: credentials.host.clone(),
            client: credentials.client.clone(),
        })
    }
}
