//! Credential module
//!
//! Resolves the SAP connection credentials from an ordered chain of sources:
//! explicit configuration, process environment, a remote secret store and,
//! to find the secret store's project, the instance metadata server.

pub mod gcp;
pub mod resolver;

use crate::config::Settings;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

pub use gcp::{GcpSecretManager, MetadataServer};
pub use resolver::CredentialResolver;

/// Keys that must be present before any authenticated SAP call
pub const REQUIRED_KEYS: [&str; 3] = ["SAP_HOST", "SAP_USERNAME", "SAP_PASSWORD"];

/// Credential errors
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error(
        "Missing SAP credentials: {}. Ensure credentials are set via config, environment or secret store",
        .0.join(", ")
    )]
    MissingCredentials(Vec<String>),

    #[error("Invalid value for {field}: '{value}'")]
    Invalid { field: String, value: String },

    #[error("Secret store error: {0}")]
    SecretStore(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// A remote store holding the credential blob as a JSON object
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the latest version of secret `name` in `project_id`.
    async fn fetch_secret(
        &self,
        project_id: &str,
        name: &str,
    ) -> Result<Map<String, Value>, CredentialError>;

    /// Store name for logging
    fn store_type(&self) -> &'static str;
}

/// Discovers the project identifier when none is configured
#[async_trait]
pub trait ProjectDiscovery: Send + Sync {
    /// Returns `None` when discovery is impossible; never fails hard.
    async fn discover_project_id(&self) -> Option<String>;
}

/// Complete SAP connection credentials
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub host: String,
    pub port: u16,
    pub client: String,
    pub username: String,
    pub password: String,
    pub verify_ssl: bool,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client", &self.client)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("verify_ssl", &self.verify_ssl)
            .field("timeout_secs", &self.timeout_secs)
            .field("retry_attempts", &self.retry_attempts)
            .finish()
    }
}

impl CredentialSet {
    pub const DEFAULT_PORT: u16 = 44300;
    pub const DEFAULT_CLIENT: &'static str = "100";
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

    /// Build a credential set from the active settings.
    ///
    /// Fails with `MissingCredentials` naming every absent required key.
    pub fn from_settings(settings: &Settings) -> Result<Self, CredentialError> {
        let missing = missing_required(settings);
        if !missing.is_empty() {
            return Err(CredentialError::MissingCredentials(missing));
        }

        let required = |key: &str| settings.get(key).unwrap_or_default().to_string();

        Ok(Self {
            host: required("SAP_HOST"),
            username: required("SAP_USERNAME"),
            password: required("SAP_PASSWORD"),
            port: parse_or(settings, "SAP_PORT", Self::DEFAULT_PORT)?,
            client: settings
                .get("SAP_CLIENT")
                .unwrap_or(Self::DEFAULT_CLIENT)
                .to_string(),
            verify_ssl: parse_bool(settings, "SAP_VERIFY_SSL")?,
            timeout_secs: parse_or(settings, "SAP_TIMEOUT", Self::DEFAULT_TIMEOUT_SECS)?,
            retry_attempts: parse_or(
                settings,
                "SAP_RETRY_ATTEMPTS",
                Self::DEFAULT_RETRY_ATTEMPTS,
            )?,
        })
    }

    /// Root URL of the gateway, e.g. `https://sap.example.com:44300`.
    ///
    /// A host given with a scheme keeps it; an explicit port in the host wins
    /// over `port`.
    pub fn base_url(&self) -> Result<Url, CredentialError> {
        let raw = if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.clone()
        } else {
            format!("https://{}", self.host)
        };

        let invalid = || CredentialError::Invalid {
            field: "SAP_HOST".to_string(),
            value: self.host.clone(),
        };

        let mut url = Url::parse(raw.trim_end_matches('/')).map_err(|_| invalid())?;
        if url.port().is_none() {
            url.set_port(Some(self.port)).map_err(|_| invalid())?;
        }
        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Required keys absent from `settings`, in declaration order
pub fn missing_required(settings: &Settings) -> Vec<String> {
    REQUIRED_KEYS
        .iter()
        .filter(|key| settings.get(key).is_none())
        .map(|key| key.to_string())
        .collect()
}

fn parse_or<T: std::str::FromStr>(
    settings: &Settings,
    key: &str,
    default: T,
) -> Result<T, CredentialError> {
    match settings.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| CredentialError::Invalid {
            field: key.to_string(),
            value: raw.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool(settings: &Settings, key: &str) -> Result<bool, CredentialError> {
    match settings.get(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
        Some(v) => Err(CredentialError::Invalid {
            field: key.to_string(),
            value: v,
        }),
    }
}
