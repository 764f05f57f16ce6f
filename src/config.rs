//! Control Plane Configuration
//!
//! Configuration is read from an optional YAML file; every section falls back
//! to its defaults, and command-line flags are applied on top in `main.rs`.
//!
//! ```yaml
//! server:
//!   rest_addr: 0.0.0.0:8090
//!   public_base_url: https://cp.example.com
//! orchestrator:
//!   worker_count: 8
//!   plugin_timeout_secs: 120
//! storage:
//!   backend: file
//!   data_dir: /var/lib/declarative-control-plane
//! providers:
//!   - provider_type: kubernetes
//!     driver: simulated
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
    pub storage: StorageConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            storage: StorageConfig::default(),
            providers: default_providers(),
        }
    }
}

impl ControlPlaneConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(raw)?;
        if config.providers.is_empty() {
            config.providers = default_providers();
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject values the control plane cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.worker_count == 0 {
            return Err(Error::Configuration("worker_count must be at least 1".into()));
        }
        if self.orchestrator.queue_capacity == 0 {
            return Err(Error::Configuration("queue_capacity must be at least 1".into()));
        }
        if self.orchestrator.plugin_timeout_secs == 0 {
            return Err(Error::Configuration(
                "plugin_timeout_secs must be at least 1".into(),
            ));
        }
        if self.orchestrator.stale_operation_secs <= self.orchestrator.plugin_timeout_secs {
            return Err(Error::Configuration(
                "stale_operation_secs must exceed plugin_timeout_secs".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Server
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Health server bind address
    pub health_addr: SocketAddr,
    /// Metrics server bind address
    pub metrics_addr: SocketAddr,
    /// Base URL clients reach the API at; used for operation-status links
    pub public_base_url: String,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Seconds clients are told to wait before polling an operation
    pub retry_after_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_base_url: "http://localhost:8090".to_string(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
            retry_after_secs: 10,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum operations running against plugins at once
    pub worker_count: usize,
    /// Maximum operations waiting for a worker
    pub queue_capacity: usize,
    /// Deadline for every individual plugin call
    pub plugin_timeout_secs: u64,
    /// In-flight packages older than this are considered abandoned
    pub stale_operation_secs: u64,
    /// Interval of the recovery sweep
    pub sweep_interval_secs: u64,
}

impl OrchestratorConfig {
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }

    pub fn stale_operation_after(&self) -> Duration {
        Duration::from_secs(self.stale_operation_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_capacity: 256,
            plugin_timeout_secs: 300,
            stale_operation_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

// =============================================================================
// Storage
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the file backend
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("/var/lib/declarative-control-plane"),
        }
    }
}

// =============================================================================
// Providers
// =============================================================================

/// Plugin implementation serving a provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderDriver {
    /// In-process simulation
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_type: String,
    #[serde(default = "default_driver")]
    pub driver: ProviderDriver,
}

impl ProviderConfig {
    pub fn simulated(provider_type: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            driver: ProviderDriver::Simulated,
        }
    }
}

fn default_driver() -> ProviderDriver {
    ProviderDriver::Simulated
}

/// Provider types served when the configuration names none
pub fn default_providers() -> Vec<ProviderConfig> {
    ["kubernetes", "datadog", "cloudflare"]
        .into_iter()
        .map(ProviderConfig::simulated)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ControlPlaneConfig::from_yaml("{}").unwrap();
        assert_eq!(config.server.rest_addr.port(), 8090);
        assert_eq!(config.orchestrator.worker_count, 8);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.providers.len(), 3);
    }

    #[test]
    fn test_partial_sections() {
        let config = ControlPlaneConfig::from_yaml(
            r#"
orchestrator:
  plugin_timeout_secs: 30
storage:
  backend: file
  data_dir: /tmp/cp
providers:
  - provider_type: kubernetes
"#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.plugin_timeout(), Duration::from_secs(30));
        assert_eq!(config.orchestrator.queue_capacity, 256);
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.providers, vec![ProviderConfig::simulated("kubernetes")]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_matches!(
            ControlPlaneConfig::from_yaml("orchestrator:\n  worker_count: 0\n"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ControlPlaneConfig::from_yaml(
                "orchestrator:\n  plugin_timeout_secs: 60\n  stale_operation_secs: 30\n"
            ),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ControlPlaneConfig::from_yaml("storage:\n  backend: s3\n"),
            Err(Error::YamlParse(_))
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  retry_after_secs: 3").unwrap();
        let config = ControlPlaneConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.retry_after_secs, 3);

        assert_matches!(
            ControlPlaneConfig::from_file("/nonexistent/cp.yaml"),
            Err(Error::Configuration(_))
        );
    }
}
