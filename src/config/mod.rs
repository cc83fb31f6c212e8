//! Configuration module
//!
//! TOML settings file, environment overrides and the active key/value
//! settings the credential resolver works against.

pub mod settings;

pub use settings::{
    CatalogSection, ClientSection, Config, ConfigError, RuntimeConfig, SapSection,
    SecretsSection, Settings,
};
