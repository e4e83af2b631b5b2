use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::finality::FinalityConfig;
use crate::registry::RegistryConfig;
use crate::utils::{duration_millis, Backoff};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Attempt limit and backoff shared by every retried pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Calls made before a stage gives up, the first one included
    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,

    #[serde(with = "duration_millis")]
    pub backoff_ceiling: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_ceiling)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvingConfig {
    /// Proofs generated at the same time; further requests queue
    pub max_concurrent_proofs: usize,
}

impl Default for ProvingConfig {
    fn default() -> Self {
        Self { max_concurrent_proofs: 4 }
    }
}

/// Coalescing of destination submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_batch_size: usize,

    /// Longest time a partial batch waits before it is flushed
    #[serde(with = "duration_millis")]
    pub max_batch_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 16,
            max_batch_wait: Duration::from_secs(2),
        }
    }
}

/// Everything the relay orchestrator can be tuned with.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub finality: FinalityConfig,
    #[serde(default)]
    pub proving: ProvingConfig,
    /// Destination batching, off when absent
    #[serde(default)]
    pub batching: Option<BatchConfig>,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short timings for local chains and tests.
    pub fn development() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 3,
                backoff_base: Duration::from_millis(50),
                backoff_ceiling: Duration::from_millis(500),
            },
            finality: FinalityConfig {
                timeout: Duration::from_secs(10),
                poll_interval: Duration::from_millis(100),
                ..FinalityConfig::default()
            },
            proving: ProvingConfig { max_concurrent_proofs: 2 },
            batching: None,
            registry: RegistryConfig::permissive(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be greater than 0".to_string()));
        }
        if self.retry.backoff_base > self.retry.backoff_ceiling {
            return Err(ConfigError::Invalid(
                "retry.backoff_base must not exceed retry.backoff_ceiling".to_string(),
            ));
        }
        if self.finality.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("finality.poll_interval must be greater than 0".to_string()));
        }
        if self.finality.timeout < self.finality.poll_interval {
            return Err(ConfigError::Invalid(
                "finality.timeout must be at least one poll interval".to_string(),
            ));
        }
        if self.proving.max_concurrent_proofs == 0 {
            return Err(ConfigError::Invalid(
                "proving.max_concurrent_proofs must be greater than 0".to_string(),
            ));
        }
        if let Some(batching) = &self.batching {
            if batching.max_batch_size == 0 {
                return Err(ConfigError::Invalid("batching.max_batch_size must be greater than 0".to_string()));
            }
        }
        if self.registry.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid(
                "registry.max_concurrent_calls must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn with_finality(mut self, finality: FinalityConfig) -> Self {
        self.finality = finality;
        self
    }

    pub fn with_max_concurrent_proofs(mut self, max: usize) -> Self {
        self.proving.max_concurrent_proofs = max;
        self
    }

    pub fn with_batching(mut self, batching: BatchConfig) -> Self {
        self.batching = Some(batching);
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }
}
