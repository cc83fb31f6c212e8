//! Credential resolution
//!
//! Holds the active settings behind an async mutex so resolution is
//! serialized: concurrent callers wait for the first one instead of
//! issuing duplicate secret-store calls.

use super::gcp::{GcpSecretManager, MetadataServer};
use super::{CredentialError, CredentialSet, ProjectDiscovery, SecretStore};
use crate::config::{SecretsSection, Settings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Resolves a [`CredentialSet`] from the configured source chain
pub struct CredentialResolver {
    settings: Mutex<Settings>,
    secrets: SecretsSection,
    store: Option<Arc<dyn SecretStore>>,
    discovery: Option<Arc<dyn ProjectDiscovery>>,
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("secret_name", &self.secrets.secret_name)
            .field("store", &self.store.as_ref().map(|s| s.store_type()))
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}

impl CredentialResolver {
    /// Resolver over `settings` with no remote sources attached
    pub fn new(settings: Settings, secrets: SecretsSection) -> Self {
        Self {
            settings: Mutex::new(settings),
            secrets,
            store: None,
            discovery: None,
        }
    }

    /// Resolver wired to Secret Manager and the metadata server
    pub fn with_gcp(settings: Settings, secrets: SecretsSection) -> Result<Self, CredentialError> {
        let metadata = Arc::new(MetadataServer::new(Duration::from_millis(
            secrets.metadata_timeout_ms,
        ))?);
        let store = Arc::new(GcpSecretManager::new(
            metadata.clone(),
            Duration::from_millis(secrets.secret_timeout_ms),
        )?);

        Ok(Self::new(settings, secrets)
            .with_secret_store(store)
            .with_project_discovery(metadata))
    }

    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_project_discovery(mut self, discovery: Arc<dyn ProjectDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Resolve the connection credentials.
    ///
    /// A complete set already present in the active settings is returned
    /// as-is unless `force`. Otherwise the secret store is consulted and its
    /// blob merged before re-checking.
    pub async fn resolve(&self, force: bool) -> Result<CredentialSet, CredentialError> {
        let mut settings = self.settings.lock().await;

        if !force {
            match CredentialSet::from_settings(&settings) {
                Ok(creds) => return Ok(creds),
                Err(CredentialError::MissingCredentials(missing)) => {
                    tracing::debug!("Credentials incomplete, missing {:?}", missing);
                }
                Err(e) => return Err(e),
            }
        }

        if self.secrets.enabled {
            self.load_from_store(&mut settings).await;
        }

        CredentialSet::from_settings(&settings)
    }

    /// Snapshot of the active settings
    pub async fn settings(&self) -> Settings {
        self.settings.lock().await.clone()
    }

    /// Merge the secret blob into `settings`. Every failure here is logged
    /// and swallowed; the caller re-checks completeness afterwards.
    async fn load_from_store(&self, settings: &mut Settings) -> bool {
        let Some(store) = self.store.as_ref() else {
            tracing::debug!("No secret store configured");
            return false;
        };

        let project_id = match settings.project_id() {
            Some(id) => id.to_string(),
            None => match self.discover_project_id().await {
                Some(id) => {
                    settings.set("GOOGLE_CLOUD_PROJECT", id.clone());
                    id
                }
                None => {
                    tracing::warn!("No project id configured or discoverable, skipping secret store");
                    return false;
                }
            },
        };

        tracing::info!(
            "Loading SAP credentials from {} for project {}",
            store.store_type(),
            project_id
        );

        match store.fetch_secret(&project_id, &self.secrets.secret_name).await {
            Ok(blob) => {
                tracing::debug!("Loaded secret keys: {:?}", blob.keys().collect::<Vec<_>>());
                settings.merge_secret_blob(&blob);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to load secrets from {}: {}", store.store_type(), e);
                false
            }
        }
    }

    async fn discover_project_id(&self) -> Option<String> {
        let discovery = self.discovery.as_ref()?;
        let id = discovery.discover_project_id().await;
        if let Some(ref id) = id {
            tracing::info!("Discovered project id {} from metadata server", id);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeStore {
        blob: Option<Value>,
        calls: AtomicUsize,
        last_project: std::sync::Mutex<Option<String>>,
    }

    impl FakeStore {
        fn returning(blob: Value) -> Arc<Self> {
            Arc::new(Self {
                blob: Some(blob),
                calls: AtomicUsize::new(0),
                last_project: std::sync::Mutex::new(None),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                blob: None,
                calls: AtomicUsize::new(0),
                last_project: std::sync::Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SecretStore for FakeStore {
        async fn fetch_secret(
            &self,
            project_id: &str,
            _name: &str,
        ) -> Result<Map<String, Value>, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_project.lock().unwrap() = Some(project_id.to_string());
            tokio::time::sleep(Duration::from_millis(10)).await;
            match &self.blob {
                Some(Value::Object(map)) => Ok(map.clone()),
                _ => Err(CredentialError::SecretStore("permission denied".to_string())),
            }
        }

        fn store_type(&self) -> &'static str {
            "fake"
        }
    }

    struct FixedDiscovery(Option<&'static str>);

    #[async_trait]
    impl ProjectDiscovery for FixedDiscovery {
        async fn discover_project_id(&self) -> Option<String> {
            self.0.map(String::from)
        }
    }

    fn complete_settings() -> Settings {
        let mut settings = Settings::default();
        settings.set("SAP_HOST", "sap.example.com");
        settings.set("SAP_USERNAME", "user");
        settings.set("SAP_PASSWORD", "pw");
        settings
    }

    fn project_settings() -> Settings {
        let mut settings = Settings::default();
        settings.set("PROJECT_ID", "my-project");
        settings
    }

    fn secret_blob() -> Value {
        json!({
            "host": "secret-host",
            "username": "secret-user",
            "password": "secret-pw",
            "client": "200"
        })
    }

    #[tokio::test]
    async fn test_complete_settings_skip_secret_store() {
        let store = FakeStore::returning(secret_blob());
        let resolver = CredentialResolver::new(complete_settings(), SecretsSection::default())
            .with_secret_store(store.clone());

        let first = resolver.resolve(false).await.unwrap();
        let second = resolver.resolve(false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.host, "sap.example.com");
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_secret_blob_fills_missing_credentials() {
        let store = FakeStore::returning(secret_blob());
        let resolver = CredentialResolver::new(project_settings(), SecretsSection::default())
            .with_secret_store(store.clone());

        let creds = resolver.resolve(false).await.unwrap();
        assert_eq!(creds.host, "secret-host");
        assert_eq!(creds.client, "200");
        assert_eq!(store.last_project.lock().unwrap().as_deref(), Some("my-project"));

        // Now complete, no further store calls
        resolver.resolve(false).await.unwrap();
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_force_reloads_and_overwrites() {
        let store = FakeStore::returning(secret_blob());
        let mut settings = complete_settings();
        settings.set("PROJECT_ID", "my-project");
        let resolver = CredentialResolver::new(settings, SecretsSection::default())
            .with_secret_store(store.clone());

        let creds = resolver.resolve(true).await.unwrap();
        assert_eq!(creds.host, "secret-host");
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_force_keeps_existing_when_store_fails() {
        let store = FakeStore::failing();
        let mut settings = complete_settings();
        settings.set("PROJECT_ID", "my-project");
        let resolver = CredentialResolver::new(settings, SecretsSection::default())
            .with_secret_store(store.clone());

        let creds = resolver.resolve(true).await.unwrap();
        assert_eq!(creds.host, "sap.example.com");
    }

    #[tokio::test]
    async fn test_all_sources_fail_lists_missing_fields() {
        let store = FakeStore::failing();
        let resolver = CredentialResolver::new(project_settings(), SecretsSection::default())
            .with_secret_store(store);

        let err = resolver.resolve(false).await.unwrap_err();
        match err {
            CredentialError::MissingCredentials(fields) => {
                assert_eq!(fields, vec!["SAP_HOST", "SAP_USERNAME", "SAP_PASSWORD"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_project_discovered_from_metadata() {
        let store = FakeStore::returning(secret_blob());
        let resolver = CredentialResolver::new(Settings::default(), SecretsSection::default())
            .with_secret_store(store.clone())
            .with_project_discovery(Arc::new(FixedDiscovery(Some("discovered"))));

        resolver.resolve(false).await.unwrap();
        assert_eq!(store.last_project.lock().unwrap().as_deref(), Some("discovered"));
        assert_eq!(
            resolver.settings().await.project_id(),
            Some("discovered")
        );
    }

    #[tokio::test]
    async fn test_no_project_disables_secret_store() {
        let store = FakeStore::returning(secret_blob());
        let resolver = CredentialResolver::new(Settings::default(), SecretsSection::default())
            .with_secret_store(store.clone())
            .with_project_discovery(Arc::new(FixedDiscovery(None)));

        assert!(resolver.resolve(false).await.is_err());
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_disabled_secrets_never_call_store() {
        let store = FakeStore::returning(secret_blob());
        let secrets = SecretsSection {
            enabled: false,
            ..Default::default()
        };
        let resolver =
            CredentialResolver::new(project_settings(), secrets).with_secret_store(store.clone());

        assert!(resolver.resolve(false).await.is_err());
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_single_store_call() {
        let store = FakeStore::returning(secret_blob());
        let resolver = Arc::new(
            CredentialResolver::new(project_settings(), SecretsSection::default())
                .with_secret_store(store.clone()),
        );

        let tasks = (0..8).map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve(false).await })
        });

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap().username, "secret-user");
        }
        assert_eq!(store.calls(), 1);
    }

    #[test]
    fn test_resolve_outside_runtime() {
        let resolver = CredentialResolver::new(complete_settings(), SecretsSection::default());
        let creds = tokio_test::block_on(resolver.resolve(false)).unwrap();
        assert_eq!(creds.username, "user");
    }
}
