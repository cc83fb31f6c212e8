//! Connector-level errors

use crate::auth::CredentialError;
use crate::catalog::CatalogError;
use crate::odata::ODataError;
use thiserror::Error;

/// Errors surfaced by [`crate::SapConnector`] operations
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Service '{service}' not found. Available: {}", .available.join(", "))]
    ServiceNotFound {
        service: String,
        available: Vec<String>,
    },

    #[error(
        "Entity set '{entity_set}' not found in service '{service}'. Available: {}",
        .available.join(", ")
    )]
    EntityNotFound {
        service: String,
        entity_set: String,
        available: Vec<String>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    OData(#[from] ODataError),
}
