//! SAP OData MCP Library
//!
//! Connector and Model Context Protocol server for SAP Gateway OData v2
//! services. Credentials come from configuration, the environment or
//! Google Cloud Secret Manager.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod connector;
pub mod error;
pub mod mcp;
pub mod odata;

pub use auth::{CredentialResolver, CredentialSet};
pub use catalog::ServiceCatalog;
pub use config::{Config, RuntimeConfig};
pub use connector::{QueryRequest, SapConnector};
pub use error::ConnectorError;
pub use odata::{normalize, ODataError, OutputFormat, QueryOptions, SapClient};
