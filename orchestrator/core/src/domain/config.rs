// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordinator Configuration
//!
//! Kubernetes-style YAML manifest for a coordinator process:
//!
//! ```yaml
//! apiVersion: canopy.dev/v1
//! kind: CoordinatorConfig
//! metadata:
//!   name: dev-coordinator
//! spec:
//!   server: { bind_address: 127.0.0.1, port: 8700 }
//!   storage: { backend: in-memory }
//!   delegation: { acceptance_timeout_seconds: 300 }
//! ```
//!
//! Discovery order: explicit path, `CANOPY_CONFIG_PATH`, `./canopy-config.yaml`,
//! `~/.canopy/config.yaml`, `/etc/canopy/config.yaml`, then built-in defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::instance::Scope;
use crate::domain::repository::{PostgresConfig, StorageBackend};

pub const API_VERSION: &str = "canopy.dev/v1";
pub const KIND: &str = "CoordinatorConfig";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfigManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMetadata,
    #[serde(default)]
    pub spec: CoordinatorConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfigSpec {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    #[default]
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::InMemory,
            connection_string: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    /// PENDING delegations older than this are auto-rejected.
    #[serde(default = "default_acceptance_timeout")]
    pub acceptance_timeout_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Candidates tried on `CapacityExceeded` before surfacing a routing failure.
    #[serde(default = "default_capacity_attempts")]
    pub max_capacity_attempts: u32,
    /// Target scopes whose delegations are accepted as part of `delegate`.
    #[serde(default)]
    pub auto_accept_scopes: Vec<Scope>,
    #[serde(default = "default_true")]
    pub redispatch_on_timeout: bool,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            acceptance_timeout_seconds: default_acceptance_timeout(),
            sweep_interval_seconds: default_sweep_interval(),
            max_capacity_attempts: default_capacity_attempts(),
            auto_accept_scopes: Vec::new(),
            redispatch_on_timeout: true,
        }
    }
}

impl DelegationConfig {
    pub fn acceptance_timeout(&self) -> Duration {
        Duration::from_secs(self.acceptance_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn auto_accepts(&self, scope: Scope) -> bool {
        self.auto_accept_scopes.contains(&scope)
    }
}

/// Bounded backoff for idempotent reads. Writes are never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            read_attempts: default_read_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8700
}

fn default_max_connections() -> u32 {
    5
}

fn default_acceptance_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_capacity_attempts() -> u32 {
    3
}

fn default_read_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    50
}

fn default_max_backoff() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for CoordinatorConfigManifest {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "canopy-coordinator".to_string());
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: CoordinatorConfigSpec::default(),
        }
    }
}

impl CoordinatorConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CANOPY_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./canopy-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".canopy").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/canopy/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overrides from an arbitrary lookup, so callers can test without
    /// touching the process environment.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("CANOPY_DATABASE_URL").filter(|u| !u.is_empty()) {
            self.spec.storage.backend = StorageKind::Postgres;
            self.spec.storage.connection_string = Some(url);
        }

        if let Some(port) = lookup("CANOPY_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.spec.server.port = port,
                Err(_) => tracing::warn!("Ignoring invalid CANOPY_PORT: {}", port),
            }
        }

        if let Some(timeout) = lookup("CANOPY_ACCEPTANCE_TIMEOUT_SECONDS") {
            match timeout.parse::<u64>() {
                Ok(secs) => self.spec.delegation.acceptance_timeout_seconds = secs,
                Err(_) => tracing::warn!(
                    "Ignoring invalid CANOPY_ACCEPTANCE_TIMEOUT_SECONDS: {}",
                    timeout
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.storage.backend == StorageKind::Postgres
            && self
                .spec
                .storage
                .connection_string
                .as_deref()
                .map_or(true, str::is_empty)
        {
            anyhow::bail!("spec.storage.connection_string is required for the postgres backend");
        }

        if self.spec.storage.max_connections == 0 {
            anyhow::bail!("spec.storage.max_connections must be at least 1");
        }

        let delegation = &self.spec.delegation;
        if delegation.acceptance_timeout_seconds == 0 {
            anyhow::bail!("spec.delegation.acceptance_timeout_seconds must be greater than 0");
        }
        if delegation.sweep_interval_seconds == 0 {
            anyhow::bail!("spec.delegation.sweep_interval_seconds must be greater than 0");
        }
        if delegation.max_capacity_attempts == 0 {
            anyhow::bail!("spec.delegation.max_capacity_attempts must be at least 1");
        }

        if self.spec.retry.read_attempts == 0 {
            anyhow::bail!("spec.retry.read_attempts must be at least 1");
        }

        if self.spec.event_bus.capacity == 0 {
            anyhow::bail!("spec.event_bus.capacity must be at least 1");
        }

        match self.spec.observability.log_format.as_str() {
            "compact" | "json" => {}
            other => anyhow::bail!("Unsupported log_format '{}'. Use 'compact' or 'json'", other),
        }

        Ok(())
    }

    /// Repository backend selected by this configuration.
    pub fn storage_backend(&self) -> StorageBackend {
        match (&self.spec.storage.backend, &self.spec.storage.connection_string) {
            (StorageKind::Postgres, Some(url)) => StorageBackend::PostgreSQL(PostgresConfig {
                connection_string: url.clone(),
                max_connections: self.spec.storage.max_connections,
            }),
            _ => StorageBackend::InMemory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_manifest() {
        let manifest = CoordinatorConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.server.port, 8700);
        assert_eq!(manifest.spec.delegation.acceptance_timeout_seconds, 300);
        assert!(matches!(manifest.storage_backend(), StorageBackend::InMemory));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: canopy.dev/v1
kind: CoordinatorConfig
metadata:
  name: test-coordinator
spec:
  delegation:
    acceptance_timeout_seconds: 30
    auto_accept_scopes: [PROJECT]
  observability:
    log_format: json
"#;
        let manifest = CoordinatorConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "test-coordinator");
        assert_eq!(manifest.spec.delegation.acceptance_timeout_seconds, 30);
        assert_eq!(manifest.spec.delegation.sweep_interval_seconds, 15);
        assert!(manifest.spec.delegation.auto_accepts(Scope::Project));
        assert!(!manifest.spec.delegation.auto_accepts(Scope::Orchestration));
        assert_eq!(manifest.spec.server.bind_address, "127.0.0.1");
        assert_eq!(manifest.spec.observability.log_format, "json");
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let mut manifest = CoordinatorConfigManifest::default();
        manifest.metadata.name = "roundtrip".to_string();
        manifest.spec.delegation.max_capacity_attempts = 5;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canopy-config.yaml");
        manifest.to_yaml_file(&path).unwrap();

        let loaded = CoordinatorConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "roundtrip");
        assert_eq!(loaded.spec.delegation.max_capacity_attempts, 5);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = CoordinatorConfigManifest::load_or_default(Some(dir.path().join("nope.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_yaml_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "apiVersion: [unclosed").unwrap();
        assert!(CoordinatorConfigManifest::from_yaml_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut manifest = CoordinatorConfigManifest::default();
        manifest.apply_overrides_from(|key| match key {
            "CANOPY_DATABASE_URL" => Some("postgres://canopy@localhost/canopy".to_string()),
            "CANOPY_PORT" => Some("9100".to_string()),
            "CANOPY_ACCEPTANCE_TIMEOUT_SECONDS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(manifest.spec.storage.backend, StorageKind::Postgres);
        assert_eq!(manifest.spec.server.port, 9100);
        assert_eq!(manifest.spec.delegation.acceptance_timeout_seconds, 300);
        match manifest.storage_backend() {
            StorageBackend::PostgreSQL(pg) => {
                assert_eq!(pg.connection_string, "postgres://canopy@localhost/canopy");
                assert_eq!(pg.max_connections, 5);
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }

    #[test]
    fn test_validation() {
        let mut manifest = CoordinatorConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.metadata.name = "".to_string();
        assert!(manifest.validate().is_err());
        manifest.metadata.name = "coordinator".to_string();

        manifest.spec.storage.backend = StorageKind::Postgres;
        assert!(manifest.validate().is_err());
        manifest.spec.storage.connection_string = Some("postgres://localhost/canopy".to_string());
        assert!(manifest.validate().is_ok());

        manifest.spec.delegation.acceptance_timeout_seconds = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.delegation.acceptance_timeout_seconds = 10;

        manifest.spec.delegation.max_capacity_attempts = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.delegation.max_capacity_attempts = 1;

        manifest.spec.observability.log_format = "pretty".to_string();
        assert!(manifest.validate().is_err());
    }
}
