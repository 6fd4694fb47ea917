use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::coordinator::error::CoordinatorError;
use crate::coordinator::retry::{DeliveryPolicy, RetryConfig};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub coordinator: CoordinatorConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// hourly | daily | never
    pub rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "coordinator.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
        }
    }
}

/// Coordinator tuning shared by every transaction in the process
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Capacity of the storage write ticket pool
    pub write_tickets: usize,
    /// Cancel transactions still undecided after this long (None = never)
    pub transaction_lifetime_limit_ms: Option<u64>,
    pub retry: RetryConfig,
    pub delivery: DeliveryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            write_tickets: 128,
            transaction_lifetime_limit_ms: Some(60_000),
            retry: RetryConfig::default(),
            delivery: DeliveryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn lifetime_limit(&self) -> Option<Duration> {
        self.transaction_lifetime_limit_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/coordinator".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoordinatorError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CoordinatorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> Result<Self, CoordinatorError> {
        Self::from_file(format!("config/{}.yaml", env))
    }
}
