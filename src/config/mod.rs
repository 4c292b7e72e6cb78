//! Configuration module for the uniquery service.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Broker settings (bootstrap servers, tenant, consumer group, timeouts)
//! - Engine settings (worker pool, topic discovery, locale)
//! - External service endpoints

mod app;
mod validation;

pub use app::{AppConfig, BrokerAuth, BrokerConfig, EngineConfig, ServicesConfig};
pub use validation::{expand_env_vars, ConfigError};

// Re-export constants
pub use app::{
    DEFAULT_MAX_BATCH_SIZE, DEFAULT_POLL_TIMEOUT, DEFAULT_TOPIC_REFRESH_INTERVAL,
    DEFAULT_TRANSACTION_TIMEOUT, DEFAULT_WORKER_POOL_SIZE,
};
