//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::ratelimit::{
    PolicyTable, DEFAULT_GC_INTERVAL, DEFAULT_KEY_PREFIX, DEFAULT_OPERATION_TIMEOUT,
};

/// Prefix for environment overrides, e.g. `GATEKEEPER__REDIS__URL`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Counter store configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// In-process counter store, for single replica deployments
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Namespace prefix for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single Redis round trip, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_operation_timeout_ms() -> u64 {
    DEFAULT_OPERATION_TIMEOUT.as_millis() as u64
}

/// In-process counter store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Seconds between sweeps of expired records; 0 disables the sweep
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: default_gc_interval_secs(),
        }
    }
}

impl MemoryConfig {
    pub fn gc_interval(&self) -> Option<Duration> {
        match self.gc_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn default_gc_interval_secs() -> u64 {
    DEFAULT_GC_INTERVAL.as_secs()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Master switch; when off no limits are enforced
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Path to a YAML policy file replacing the built-in table
    #[serde(default)]
    pub policy_path: Option<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            policy_path: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl RateLimitingConfig {
    /// The policy file if configured, otherwise the built-in table.
    pub fn load_policies(&self) -> Result<PolicyTable> {
        match &self.policy_path {
            Some(path) => PolicyTable::from_file(path),
            None => Ok(PolicyTable::default()),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from an optional file plus `GATEKEEPER__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
