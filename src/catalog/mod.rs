//! Service catalog
//!
//! Declarative list of the SAP OData services and entity sets the connector
//! may query, loaded from YAML and validated up front.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Catalog file looked up in the working directory
pub const LOCAL_CATALOG_PATH: &str = "services.yaml";

/// Catalog file inside the uploaded deployment artifact directory
pub const DEPLOYED_CATALOG_PATH: &str = "agent_config/services.yaml";

/// Catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Service catalog not found. Looked in: {}", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    NotFound(Vec<PathBuf>),

    #[error("Failed to read service catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse service catalog: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Duplicate service id '{0}' in catalog")]
    DuplicateService(String),

    #[error("Duplicate entity set '{entity}' in service '{service}'")]
    DuplicateEntity { service: String, entity: String },

    #[error("Missing required field '{field}' in {context}")]
    MissingField { field: &'static str, context: String },
}

/// How an entity key is rendered as an OData key literal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Bare when the key is all digits, quoted otherwise
    #[default]
    Auto,
    String,
    Numeric,
}

/// One entity set within a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub key_field: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "is_auto")]
    pub key_kind: KeyKind,
}

fn is_auto(kind: &KeyKind) -> bool {
    *kind == KeyKind::Auto
}

/// One OData service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub entities: Vec<EntityDescriptor>,
}

fn default_version() -> String {
    "2.0".to_string()
}

impl ServiceDescriptor {
    /// Exact, case-sensitive lookup of an entity set
    pub fn get_entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    services: Vec<ServiceDescriptor>,
}

/// Loaded, validated service catalog
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: Vec<ServiceDescriptor>,
    source: Option<PathBuf>,
}

impl ServiceCatalog {
    /// Load and validate a catalog file
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut catalog = Self::from_yaml(&content)?;
        catalog.source = Some(path.to_path_buf());

        tracing::info!(
            "Loaded {} services from {}",
            catalog.services.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Parse and validate a catalog from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, CatalogError> {
        let document: CatalogDocument = serde_yaml::from_str(content)?;
        Self::from_services(document.services)
    }

    pub fn from_services(services: Vec<ServiceDescriptor>) -> Result<Self, CatalogError> {
        let mut ids = HashSet::new();

        for service in &services {
            if service.id.trim().is_empty() {
                return Err(CatalogError::MissingField {
                    field: "id",
                    context: format!("service '{}'", service.name),
                });
            }
            if service.path.trim().is_empty() {
                return Err(CatalogError::MissingField {
                    field: "path",
                    context: format!("service '{}'", service.id),
                });
            }
            if !ids.insert(service.id.as_str()) {
                return Err(CatalogError::DuplicateService(service.id.clone()));
            }

            let mut names = HashSet::new();
            for entity in &service.entities {
                if entity.name.trim().is_empty() {
                    return Err(CatalogError::MissingField {
                        field: "name",
                        context: format!("an entity of service '{}'", service.id),
                    });
                }
                if entity.key_field.trim().is_empty() {
                    return Err(CatalogError::MissingField {
                        field: "key_field",
                        context: format!("entity '{}' of service '{}'", entity.name, service.id),
                    });
                }
                if !names.insert(entity.name.as_str()) {
                    return Err(CatalogError::DuplicateEntity {
                        service: service.id.clone(),
                        entity: entity.name.clone(),
                    });
                }
            }
        }

        Ok(Self {
            services,
            source: None,
        })
    }

    /// Choose the catalog file: the override if given, else the local
    /// default, else the deployment-artifact path. Exactly one is picked.
    pub fn resolve_path(override_path: Option<&Path>, base_dir: &Path) -> Result<PathBuf, CatalogError> {
        if let Some(path) = override_path {
            return Ok(path.to_path_buf());
        }

        let candidates = [
            base_dir.join(LOCAL_CATALOG_PATH),
            base_dir.join(DEPLOYED_CATALOG_PATH),
        ];

        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(candidates.to_vec()))
    }

    /// Resolve the path relative to the working directory and load it
    pub fn discover(override_path: Option<&Path>) -> Result<Self, CatalogError> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let path = Self::resolve_path(override_path, &cwd)?;
        Self::load(&path)
    }

    pub fn get(&self, id: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn get_entity(&self, service: &str, name: &str) -> Option<&EntityDescriptor> {
        self.get(service).and_then(|s| s.get_entity(name))
    }

    /// Service ids in catalog order
    pub fn list_ids(&self) -> Vec<String> {
        self.services.iter().map(|s| s.id.clone()).collect()
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// File the catalog was loaded from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
services:
  - id: sales_order
    name: Sales Order Service
    path: /sap/opu/odata/sap/ZSD004_SRV
    version: "2.0"
    description: Sales order headers and items
    entities:
      - name: zsd004Set
        key_field: OrderID
        description: Sales orders
  - id: flight
    name: Flight Demo
    path: /sap/opu/odata/iwfnd/RMTSAMPLEFLIGHT
    entities:
      - name: CarrierCollection
        key_field: carrid
      - name: TravelagencyCollection
        key_field: agencynum
        key_kind: numeric
"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = ServiceCatalog::from_yaml(SAMPLE).unwrap();
        assert_eq!(catalog.list_ids(), vec!["sales_order", "flight"]);

        let service = catalog.get("sales_order").unwrap();
        assert_eq!(service.path, "/sap/opu/odata/sap/ZSD004_SRV");
        assert_eq!(service.get_entity("zsd004Set").unwrap().key_field, "OrderID");

        let flight = catalog.get("flight").unwrap();
        assert_eq!(flight.version, "2.0");
        assert_eq!(
            flight.get_entity("TravelagencyCollection").unwrap().key_kind,
            KeyKind::Numeric
        );
    }

    #[test]
    fn test_lookup_misses() {
        let catalog = ServiceCatalog::from_yaml(SAMPLE).unwrap();
        assert!(catalog.get("unknown").is_none());
        assert!(catalog.get("SALES_ORDER").is_none());
        assert!(catalog.get_entity("sales_order", "ZSD004SET").is_none());
        assert!(catalog.get_entity("unknown", "zsd004Set").is_none());
    }

    #[test]
    fn test_list_ids_unique() {
        let catalog = ServiceCatalog::from_yaml(SAMPLE).unwrap();
        let ids = catalog.list_ids();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
        assert_eq!(ids.len(), catalog.len());
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let yaml = r#"
services:
  - { id: a, name: A, path: /a }
  - { id: a, name: A2, path: /a2 }
"#;
        let err = ServiceCatalog::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateService(ref id) if id == "a"));
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let yaml = r#"
services:
  - id: a
    name: A
    path: /a
    entities:
      - { name: E, key_field: K }
      - { name: E, key_field: K2 }
"#;
        let err = ServiceCatalog::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateEntity { .. }));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let yaml = r#"
services:
  - id: a
    name: A
"#;
        assert!(matches!(
            ServiceCatalog::from_yaml(yaml).unwrap_err(),
            CatalogError::Parse(_)
        ));

        let yaml = r#"
services:
  - { id: "", name: A, path: /a }
"#;
        assert!(matches!(
            ServiceCatalog::from_yaml(yaml).unwrap_err(),
            CatalogError::MissingField { field: "id", .. }
        ));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert!(ServiceCatalog::from_yaml("services: [ {id: ").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let catalog = ServiceCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.source(), Some(file.path()));
    }

    #[test]
    fn test_resolve_path_order() {
        let dir = tempfile::tempdir().unwrap();

        let err = ServiceCatalog::resolve_path(None, dir.path()).unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(ref c) if c.len() == 2));

        std::fs::create_dir(dir.path().join("agent_config")).unwrap();
        std::fs::write(dir.path().join(DEPLOYED_CATALOG_PATH), SAMPLE).unwrap();
        assert_eq!(
            ServiceCatalog::resolve_path(None, dir.path()).unwrap(),
            dir.path().join(DEPLOYED_CATALOG_PATH)
        );

        std::fs::write(dir.path().join(LOCAL_CATALOG_PATH), SAMPLE).unwrap();
        assert_eq!(
            ServiceCatalog::resolve_path(None, dir.path()).unwrap(),
            dir.path().join(LOCAL_CATALOG_PATH)
        );

        let explicit = Path::new("/etc/sap/services.yaml");
        assert_eq!(
            ServiceCatalog::resolve_path(Some(explicit), dir.path()).unwrap(),
            explicit
        );
    }

    #[test]
    fn test_example_catalog_parses() {
        let catalog = ServiceCatalog::from_yaml(include_str!("../../services.example.yaml")).unwrap();
        assert_eq!(catalog.list_ids(), vec!["sales_order", "flight"]);
        assert_eq!(
            catalog.get_entity("flight", "CarrierCollection").unwrap().key_kind,
            KeyKind::String
        );
    }
}
