//! Connector configuration.
//!
//! Two layers:
//! - [`ConnectionOptions`]: the broker connection string.
//! - [`BusSettings`]: application settings (connection string plus retry,
//!   recovery and drain tuning), loaded from YAML files and environment.

mod connection;

pub use connection::{
    CommandMode, ConnectionOptions, Endpoint, DEFAULT_PORT, DEFAULT_SENTINEL_PORT,
};

use std::time::Duration;

use serde::Deserialize;

use crate::utils::retry::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SENTINEL_BUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SENTINEL_BUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SENTINEL_BUS_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Connection string is empty")]
    Empty,

    #[error("Connection string names no endpoints")]
    NoEndpoints,

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Invalid value '{value}' for option '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("Unknown option '{0}'")]
    UnknownOption(String),

    #[error("Failed to load settings: {0}")]
    Load(String),
}

/// Application settings for the connector.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Broker connection string (see [`ConnectionOptions::parse`]).
    pub connection_string: String,
    /// Database index used for publish and recovery.
    pub database: i64,
    /// Upper bound on draining in-flight commands when closing.
    pub drain_timeout_ms: u64,
    /// Liveness probe interval for the Redis backend.
    pub health_check_interval_ms: u64,
    pub recovery: RecoverySettings,
    pub discovery: DiscoverySettings,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            connection_string: "localhost:6379".to_string(),
            database: 0,
            drain_timeout_ms: 5_000,
            health_check_interval_ms: 1_000,
            recovery: RecoverySettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

/// Recovery polling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Interval between connectivity probes before restoring a key.
    pub poll_interval_ms: u64,
    /// Give up waiting after this long. `None` waits forever.
    pub timeout_ms: Option<u64>,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            timeout_ms: Some(30_000),
        }
    }
}

/// Discovery (Sentinel) link configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Delay between attempts to reopen a failed discovery session.
    pub reconnect_interval_ms: u64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<usize>,
    /// Interval between connectivity probes after the session reports restored.
    pub connected_poll_interval_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 200,
            max_reconnect_attempts: None,
            connected_poll_interval_ms: 200,
        }
    }
}

impl BusSettings {
    /// Load settings from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Parse the configured connection string.
    pub fn connection_options(&self) -> Result<ConnectionOptions, ConfigError> {
        ConnectionOptions::parse(&self.connection_string)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl RecoverySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::bounded_by(
            Duration::from_millis(self.poll_interval_ms),
            self.timeout_ms.map(Duration::from_millis),
        )
    }
}

impl DiscoverySettings {
    pub fn reconnect_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::fixed(Duration::from_millis(self.reconnect_interval_ms));
        match self.max_reconnect_attempts {
            Some(attempts) => policy.with_max_attempts(attempts),
            None => policy,
        }
    }

    pub fn connected_poll_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.connected_poll_interval_ms))
    }
}
