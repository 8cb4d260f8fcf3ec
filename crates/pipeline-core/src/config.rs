//! Worker configuration
//!
//! Loaded from YAML; every field has a default so a partial file works.
//!
//! ```yaml
//! bus:
//!   max_message_bytes: 1000000
//! retry:
//!   max_attempts: 3
//!   first_backoff_ms: 100
//! concurrency: 16
//! spill_prefix: spill/
//! claim_capacity: 100000
//! terminated_capacity: 10000
//! storage:
//!   backend: local
//!   root: /var/lib/video-pipeline
//! ```

use crate::claim::DEFAULT_CLAIM_CAPACITY;
use crate::context::DEFAULT_TERMINATED_CAPACITY;
use crate::retry::{BackoffPolicy, RobustExecutor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use video_pipeline_storage::StorageConfig;

/// Environment variable overriding `bus.max_message_bytes`
pub const MAX_MESSAGE_BYTES_ENV: &str = "VPE_MAX_MESSAGE_BYTES";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Largest envelope the bus accepts, in bytes
    pub max_message_bytes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub first_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first_backoff_ms: 100,
            max_backoff_ms: 5_000,
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.first_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            factor: self.factor,
        }
    }

    #[must_use]
    pub fn executor(&self) -> RobustExecutor {
        RobustExecutor::new(self.max_attempts, self.backoff())
    }
}

/// Settings for one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub bus: BusConfig,
    pub retry: RetryConfig,

    /// Envelopes handled concurrently
    pub concurrency: usize,

    /// Bulk store directory for spilled payloads
    pub spill_prefix: String,

    /// Samples kept per tracklet before publishing
    pub max_tracklet_samples: usize,

    /// Invocation claims remembered for duplicate detection
    pub claim_capacity: usize,

    /// Terminated tasks remembered
    pub terminated_capacity: usize,

    pub storage: StorageConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            retry: RetryConfig::default(),
            concurrency: 16,
            spill_prefix: String::new(),
            max_tracklet_samples: 16,
            claim_capacity: DEFAULT_CLAIM_CAPACITY,
            terminated_capacity: DEFAULT_TERMINATED_CAPACITY,
            storage: StorageConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Parse YAML, then apply environment overrides and validate
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Apply `VPE_MAX_MESSAGE_BYTES` if it is set and parses
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(MAX_MESSAGE_BYTES_ENV) {
            match value.parse() {
                Ok(bytes) => self.bus.max_message_bytes = bytes,
                Err(_) => warn!(value = %value, "Ignoring unparsable {}", MAX_MESSAGE_BYTES_ENV),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "bus.max_message_bytes must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.claim_capacity == 0 || self.terminated_capacity == 0 {
            return Err(ConfigError::Invalid(
                "claim_capacity and terminated_capacity must be at least 1".to_string(),
            ));
        }
        if !(self.retry.factor.is_finite() && self.retry.factor >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.factor must be a finite number >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}
