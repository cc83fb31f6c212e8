//! Settings loading
//!
//! The TOML file provides explicit values; process environment only fills
//! what the file leaves unset.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable pointing at the TOML settings file
pub const CONFIG_PATH_ENV: &str = "SAP_MCP_CONFIG";

/// Default settings file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "sap-odata-mcp.toml";

/// Connection keys understood by the credential resolver.
pub const SAP_KEYS: [&str; 8] = [
    "SAP_HOST",
    "SAP_PORT",
    "SAP_CLIENT",
    "SAP_USERNAME",
    "SAP_PASSWORD",
    "SAP_VERIFY_SSL",
    "SAP_TIMEOUT",
    "SAP_RETRY_ATTEMPTS",
];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Root of the TOML settings file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sap: SapSection,
    #[serde(default)]
    pub secrets: SecretsSection,
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub client: ClientSection,
}

/// `[sap]` connection values. Everything is optional here; completeness is
/// checked by the credential resolver.
#[derive(Clone, Default, Deserialize)]
pub struct SapSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub client: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_ssl: Option<bool>,
    pub timeout: Option<u64>,
    pub retry_attempts: Option<u32>,
}

impl std::fmt::Debug for SapSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SapSection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client", &self.client)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("verify_ssl", &self.verify_ssl)
            .field("timeout", &self.timeout)
            .field("retry_attempts", &self.retry_attempts)
            .finish()
    }
}

/// `[secrets]` remote secret store settings
#[derive(Debug, Clone, Deserialize)]
pub struct SecretsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub project_id: Option<String>,
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
    #[serde(default = "default_secret_timeout_ms")]
    pub secret_timeout_ms: u64,
}

impl Default for SecretsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            project_id: None,
            secret_name: default_secret_name(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            secret_timeout_ms: default_secret_timeout_ms(),
        }
    }
}

/// `[catalog]` service catalog location
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSection {
    pub path: Option<PathBuf>,
}

/// `[client]` HTTP behaviour towards SAP Gateway
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_auth_path")]
    pub auth_path: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            auth_path: default_auth_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_secret_name() -> String {
    "sap-credentials".to_string()
}

fn default_metadata_timeout_ms() -> u64 {
    2000
}

fn default_secret_timeout_ms() -> u64 {
    5000
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_auth_path() -> String {
    "/sap/opu/odata/IWFND/CATALOGSERVICE;v=2/".to_string()
}

/// Resolved non-credential settings handed to the connector
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub secrets: SecretsSection,
    pub catalog_path: Option<PathBuf>,
    pub retry_delay_ms: u64,
    pub auth_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Config::default().to_runtime(std::iter::empty())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from `SAP_MCP_CONFIG` or `./sap-odata-mcp.toml`.
    ///
    /// A missing default file is not an error: everything can come from the
    /// environment or the secret store. An explicitly named file must exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::load(Path::new(&path));
        }

        let path = Path::new(DEFAULT_CONFIG_FILE);
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
            Ok(Self::default())
        }
    }

    /// Build the active settings: explicit `[sap]` values first, then any
    /// `SAP_*` variable from `env` for keys the file left unset.
    pub fn to_settings<I>(&self, env: I) -> Settings
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut settings = Settings::default();
        let sap = &self.sap;

        settings.set_opt("SAP_HOST", sap.host.clone());
        settings.set_opt("SAP_PORT", sap.port.map(|p| p.to_string()));
        settings.set_opt("SAP_CLIENT", sap.client.clone());
        settings.set_opt("SAP_USERNAME", sap.username.clone());
        settings.set_opt("SAP_PASSWORD", sap.password.clone());
        settings.set_opt("SAP_VERIFY_SSL", sap.verify_ssl.map(|v| v.to_string()));
        settings.set_opt("SAP_TIMEOUT", sap.timeout.map(|t| t.to_string()));
        settings.set_opt(
            "SAP_RETRY_ATTEMPTS",
            sap.retry_attempts.map(|r| r.to_string()),
        );
        settings.set_opt("GOOGLE_CLOUD_PROJECT", self.secrets.project_id.clone());

        for (key, value) in env {
            let accepted = SAP_KEYS.contains(&key.as_str())
                || key == "GOOGLE_CLOUD_PROJECT"
                || key == "PROJECT_ID";
            if accepted && !value.is_empty() && settings.get(&key).is_none() {
                settings.set(key, value);
            }
        }

        settings
    }

    /// Non-credential runtime settings. `SAP_SERVICES_CONFIG_PATH` applies
    /// only when the file does not name a catalog.
    pub fn to_runtime<I>(&self, env: I) -> RuntimeConfig
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env_catalog = env
            .into_iter()
            .find(|(k, v)| k == "SAP_SERVICES_CONFIG_PATH" && !v.is_empty())
            .map(|(_, v)| PathBuf::from(v));

        RuntimeConfig {
            secrets: self.secrets.clone(),
            catalog_path: self.catalog.path.clone().or(env_catalog),
            retry_delay_ms: self.client.retry_delay_ms,
            auth_path: self.client.auth_path.clone(),
        }
    }
}

/// Active key/value settings (`SAP_HOST`, `SAP_USERNAME`, ...).
///
/// Owned by the credential resolver; secret-store blobs are merged into it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.values {
            if key.contains("PASSWORD") || key.contains("SECRET") {
                map.entry(key, &"[REDACTED]");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

impl Settings {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    fn set_opt(&mut self, key: &str, value: Option<String>) {
        if let Some(value) = value {
            self.set(key, value);
        }
    }

    /// Project identifier for the secret store, if one is known
    pub fn project_id(&self) -> Option<&str> {
        self.get("GOOGLE_CLOUD_PROJECT")
            .or_else(|| self.get("PROJECT_ID"))
    }

    /// Merge a secret blob: every key is upper-cased and prefixed with
    /// `SAP_`, overwriting existing values.
    pub fn merge_secret_blob(&mut self, blob: &serde_json::Map<String, serde_json::Value>) {
        for (key, value) in blob {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            self.set(format!("SAP_{}", key.to_uppercase()), value);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}
