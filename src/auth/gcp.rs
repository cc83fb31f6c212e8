//! Google Cloud credential sources
//!
//! Project discovery and access tokens from the instance metadata server,
//! and the credential blob from Secret Manager's REST API.

use super::{CredentialError, ProjectDiscovery, SecretStore};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const METADATA_BASE_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
const SECRET_MANAGER_BASE_URL: &str = "https://secretmanager.googleapis.com/v1";

/// Token response from the metadata server
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Cached token with expiry tracking
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        // Consider token expired 60 seconds before actual expiry
        self.expires_at > Instant::now() + Duration::from_secs(60)
    }
}

/// Instance metadata server client
#[derive(Debug)]
pub struct MetadataServer {
    base_url: String,
    http_client: Client,
    token_cache: RwLock<Option<CachedToken>>,
}

impl MetadataServer {
    /// Create a metadata client with the given per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, CredentialError> {
        Self::with_base_url(METADATA_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, CredentialError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            token_cache: RwLock::new(None),
        })
    }

    async fn get_text(&self, path: &str) -> Result<String, CredentialError> {
        let response = self
            .http_client
            .get(format!("{}/{}", self.base_url, path))
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CredentialError::SecretStore(format!(
                "Metadata server returned {} for {}",
                response.status(),
                path
            )));
        }

        Ok(response.text().await?)
    }

    /// Acquire or return a cached access token for the default service account.
    pub async fn access_token(&self) -> Result<String, CredentialError> {
        {
            let cache = self.token_cache.read().await;
            if let Some(ref cached) = *cache {
                if cached.is_valid() {
                    tracing::debug!("Using cached metadata access token");
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let body = self
            .get_text("instance/service-accounts/default/token")
            .await?;
        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            CredentialError::SecretStore(format!("Failed to parse token response: {}", e))
        })?;

        let mut cache = self.token_cache.write().await;
        *cache = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });

        tracing::debug!("Metadata access token acquired, expires in {}s", token.expires_in);
        Ok(token.access_token)
    }
}

#[async_trait]
impl ProjectDiscovery for MetadataServer {
    async fn discover_project_id(&self) -> Option<String> {
        match self.get_text("project/project-id").await {
            Ok(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("Project discovery via metadata server failed: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccessSecretResponse {
    payload: SecretPayload,
}

#[derive(Debug, Deserialize)]
struct SecretPayload {
    data: String,
}

/// Secret Manager client authenticated through the metadata server
#[derive(Debug)]
pub struct GcpSecretManager {
    base_url: String,
    http_client: Client,
    metadata: Arc<MetadataServer>,
}

impl GcpSecretManager {
    pub fn new(metadata: Arc<MetadataServer>, timeout: Duration) -> Result<Self, CredentialError> {
        Self::with_base_url(SECRET_MANAGER_BASE_URL, metadata, timeout)
    }

    pub fn with_base_url(
        base_url: &str,
        metadata: Arc<MetadataServer>,
        timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            metadata,
        })
    }
}

#[async_trait]
impl SecretStore for GcpSecretManager {
    async fn fetch_secret(
        &self,
        project_id: &str,
        name: &str,
    ) -> Result<Map<String, Value>, CredentialError> {
        let token = self.metadata.access_token().await?;
        let url = format!(
            "{}/projects/{}/secrets/{}/versions/latest:access",
            self.base_url, project_id, name
        );

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::SecretStore(format!(
                "Status: {}, Body: {}",
                status, body
            )));
        }

        let access: AccessSecretResponse = response.json().await.map_err(|e| {
            CredentialError::SecretStore(format!("Failed to parse secret response: {}", e))
        })?;

        let raw = base64::engine::general_purpose::STANDARD
            .decode(access.payload.data.as_bytes())
            .map_err(|e| CredentialError::SecretStore(format!("Invalid payload encoding: {}", e)))?;

        match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(CredentialError::SecretStore(
                "Secret payload is not a JSON object".to_string(),
            )),
            Err(e) => Err(CredentialError::SecretStore(format!(
                "Secret payload is not valid JSON: {}",
                e
            ))),
        }
    }

    fn store_type(&self) -> &'static str {
        "gcp-secret-manager"
    }
}
