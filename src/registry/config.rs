use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::duration_millis;

/// Configuration for the adapter registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How often to run health checks
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// Maximum outstanding calls per chain adapter
    pub max_concurrent_calls: usize,

    /// Consecutive failed calls before an adapter is disabled
    pub max_consecutive_failures: u32,

    /// Maximum average response time before marking degraded
    #[serde(with = "duration_millis")]
    pub max_response_time: Duration,

    /// Whether to automatically re-enable recovered adapters
    pub auto_reenable: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(60),
            max_concurrent_calls: 16,
            max_consecutive_failures: 5,
            max_response_time: Duration::from_secs(5),
            auto_reenable: true,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a more permissive configuration
    pub fn permissive() -> Self {
        Self {
            health_check_interval: Duration::from_secs(120),
            max_concurrent_calls: 64,
            max_consecutive_failures: 10,
            max_response_time: Duration::from_secs(10),
            auto_reenable: true,
        }
    }

    /// Create a stricter configuration
    pub fn strict() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            max_concurrent_calls: 4,
            max_consecutive_failures: 2,
            max_response_time: Duration::from_secs(2),
            auto_reenable: false,
        }
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn with_max_response_time(mut self, time: Duration) -> Self {
        self.max_response_time = time;
        self
    }

    pub fn with_auto_reenable(mut self, auto: bool) -> Self {
        self.auto_reenable = auto;
        self
    }
}
