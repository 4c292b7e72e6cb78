//! Application configuration structures.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Locale;

use super::validation::{expand_env_vars, ConfigError};

// =============================================================================
// Constants
// =============================================================================

/// Default broker session timeout (45 seconds).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(45);

/// Default broker transaction timeout (60 seconds).
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default poll window per batch (5 seconds).
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum messages per poll batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 2_000;

/// Default detection worker pool size.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 5;

/// Default topic discovery interval (2 minutes).
pub const DEFAULT_TOPIC_REFRESH_INTERVAL: Duration = Duration::from_secs(120);

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> Duration {
    DEFAULT_SESSION_TIMEOUT
}

fn default_transaction_timeout() -> Duration {
    DEFAULT_TRANSACTION_TIMEOUT
}

fn default_poll_timeout() -> Duration {
    DEFAULT_POLL_TIMEOUT
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_topic_partitions() -> i32 {
    3
}

fn default_topic_replication() -> i32 {
    1
}

fn default_worker_pool_size() -> usize {
    DEFAULT_WORKER_POOL_SIZE
}

fn default_topic_refresh_interval() -> Duration {
    DEFAULT_TOPIC_REFRESH_INTERVAL
}

fn default_locale() -> String {
    "zh-CN".to_string()
}

// =============================================================================
// Broker Configuration
// =============================================================================

/// SASL credentials for the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAuth {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

/// Message broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bootstrap servers, `host:port` comma-separated.
    pub brokers: String,

    /// Tenant prefix for all topic names.
    pub tenant: String,

    /// Consumer group id.
    pub group_id: String,

    /// Where a fresh group starts reading (default: "earliest").
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Consumer session timeout (default: 45s).
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Producer transaction timeout, also used for commits (default: 60s).
    #[serde(default = "default_transaction_timeout", with = "humantime_serde")]
    pub transaction_timeout: Duration,

    /// Poll window per batch (default: 5s).
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Maximum messages per poll batch (default: 2000).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Partitions for topics this service creates (default: 3).
    #[serde(default = "default_topic_partitions")]
    pub topic_partitions: i32,

    /// Replication factor for created topics (default: 1).
    #[serde(default = "default_topic_replication")]
    pub topic_replication: i32,

    /// Optional SASL credentials.
    #[serde(default)]
    pub auth: Option<BrokerAuth>,
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Detection engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent per-source detection workers (default: 5).
    pub worker_pool_size: usize,

    /// Topic discovery interval (default: 2m).
    #[serde(with = "humantime_serde")]
    pub topic_refresh_interval: Duration,

    /// Display locale for event titles and messages (default: "zh-CN").
    pub locale: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            topic_refresh_interval: DEFAULT_TOPIC_REFRESH_INTERVAL,
            locale: default_locale(),
        }
    }
}

impl EngineConfig {
    pub fn locale(&self) -> Locale {
        match self.locale.as_str() {
            "en-US" | "en_US" | "en" => Locale::EnUs,
            _ => Locale::ZhCn,
        }
    }
}

// =============================================================================
// External Services Configuration
// =============================================================================

/// Base URLs of the HTTP collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Event-model service.
    pub event_model_url: String,

    /// Data-model query service (routes on data-source type).
    pub data_query_url: String,

    /// Permission service.
    pub permission_url: String,
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Message broker settings.
    pub broker: BrokerConfig,

    /// Detection engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// External service endpoints.
    pub services: ServicesConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` and
    /// `${VAR:-default}` references first.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let content = expand_env_vars(&content);
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.brokers.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "broker brokers must not be empty".to_string(),
            ));
        }

        if self.broker.tenant.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "broker tenant must not be empty".to_string(),
            ));
        }

        if self.broker.group_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "broker group_id must not be empty".to_string(),
            ));
        }

        match self.broker.auto_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "broker auto_offset_reset must be 'earliest' or 'latest', got '{other}'"
                )));
            }
        }

        if self.broker.max_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "broker max_batch_size must be positive".to_string(),
            ));
        }

        if self.broker.topic_partitions <= 0 {
            return Err(ConfigError::ValidationError(
                "broker topic_partitions must be positive".to_string(),
            ));
        }

        if self.broker.topic_replication <= 0 {
            return Err(ConfigError::ValidationError(
                "broker topic_replication must be positive".to_string(),
            ));
        }

        if self.engine.worker_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "engine worker_pool_size must be positive".to_string(),
            ));
        }

        for (name, url) in [
            ("event_model_url", &self.services.event_model_url),
            ("data_query_url", &self.services.data_query_url),
            ("permission_url", &self.services.permission_url),
        ] {
            if url.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "services {name} must not be empty"
                )));
            }
        }

        Ok(())
    }
}
