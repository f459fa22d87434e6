//! Optimizer Configuration
//!
//! Typed, validated settings for every subsystem. Structurally invalid
//! configuration is rejected before anything is constructed.
//!
//! ```yaml
//! database:
//!   max_connections: 20
//!   min_connections: 4
//! cache:
//!   l1: { max_size: 5000, ttl_ms: 60000 }
//!   l2: { host: redis.internal, port: 6379, default_ttl_ms: 600000 }
//! cdn:
//!   enabled: false
//! compression:
//!   small_threshold: 1024
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheConfig;
use crate::compression::CompressionConfig;
use crate::dedup::DedupConfig;
use crate::error::{Error, Result};
use crate::monitoring::MonitoringConfig;
use crate::pagination::PaginationDefaults;

/// Connection pool hints forwarded to the database collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("database.max_connections must be positive".into()));
        }
        if self.min_connections == 0 {
            return Err(Error::Config("database.min_connections must be positive".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// CDN credentials
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CdnCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for CdnCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdnCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// CDN settings forwarded to the asset collaborator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub credentials: Option<CdnCredentials>,
}

impl CdnConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        match self.endpoint.as_deref() {
            Some(endpoint)
                if endpoint.starts_with("https://") || endpoint.starts_with("http://") =>
            {
                Ok(())
            }
            Some(endpoint) => Err(Error::Config(format!(
                "cdn.endpoint must be an http(s) URL, got {:?}",
                endpoint
            ))),
            None => Err(Error::Config("cdn.enabled requires cdn.endpoint".into())),
        }
    }
}

/// Health reporting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Bound on each subsystem check
    pub timeout_ms: u64,
    /// In-flight requests older than this degrade the deduplication check
    pub stale_request_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            stale_request_ms: 30_000,
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config("health.timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Complete optimizer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub cdn: CdnConfig,
    pub compression: CompressionConfig,
    pub pagination: PaginationDefaults,
    pub deduplication: DedupConfig,
    pub monitoring: MonitoringConfig,
    pub health: HealthConfig,
}

impl OptimizerConfig {
    /// Reject structurally invalid configuration
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.cache.validate()?;
        self.cdn.validate()?;
        self.compression.validate()?;
        self.pagination.validate()?;
        self.deduplication.validate()?;
        self.monitoring.validate()?;
        self.health.validate()
    }

    /// Parse and validate YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&contents)?;
        info!(path = %path.display(), "Loaded optimizer configuration");
        Ok(config)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::L2Config;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        assert!(OptimizerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_pool_bounds() {
        let mut config = OptimizerConfig::default();
        config.database.min_connections = 20;
        assert_matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("exceeds"));

        config.database = DatabaseConfig {
            max_connections: 0,
            min_connections: 0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_cache_sizes_rejected() {
        let mut config = OptimizerConfig::default();
        config.cache.l1.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = OptimizerConfig::default();
        config.cache.l1.ttl_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_l2_must_be_addressable() {
        let mut config = OptimizerConfig::default();
        config.cache.l2 = Some(L2Config {
            host: String::new(),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.cache.l2 = Some(L2Config {
            port: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cdn_requires_http_endpoint() {
        let mut config = OptimizerConfig::default();
        config.cdn.enabled = true;
        assert!(config.validate().is_err());

        config.cdn.endpoint = Some("ftp://cdn.example.com".into());
        assert!(config.validate().is_err());

        config.cdn.endpoint = Some("https://cdn.example.com".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = OptimizerConfig::from_yaml_str(
            r#"
database:
  max_connections: 20
cache:
  l1:
    max_size: 5000
  l2:
    host: redis.internal
    password: "p@ss"
compression:
  small_threshold: 2048
"#,
        )
        .unwrap();

        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.database.min_connections, 2);
        assert_eq!(config.cache.l1.max_size, 5000);
        assert_eq!(config.cache.l1.ttl_ms, 300_000);
        let l2 = config.cache.l2.unwrap();
        assert_eq!(l2.host, "redis.internal");
        assert_eq!(l2.port, 6379);
        assert_eq!(config.compression.small_threshold, 2048);
        assert_eq!(config.health.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        assert_matches!(
            OptimizerConfig::from_yaml_str("database: [1, 2"),
            Err(Error::Config(_))
        );
        assert_matches!(
            OptimizerConfig::from_yaml_str("database:\n  max_connections: 0\n"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            OptimizerConfig::from_yaml_file("/nonexistent/optlayer.yaml"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_credentials_are_redacted() {
        let creds = CdnCredentials {
            access_key: "AKIA".into(),
            secret_key: "hunter2".into(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("AKIA"));
        assert!(!debug.contains("hunter2"));
    }
}
