use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::utils::{duration_millis, unix_timestamp};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

/// Rolling call statistics for one adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    #[serde(skip)]
    pub last_successful_call: Option<Instant>,
    pub last_successful_timestamp: Option<u64>,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub failed_calls: u64,
    #[serde(with = "duration_millis")]
    pub avg_response_time: Duration,
    pub connection_status: ConnectionStatus,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            last_successful_call: None,
            last_successful_timestamp: None,
            consecutive_failures: 0,
            total_calls: 0,
            failed_calls: 0,
            avg_response_time: Duration::ZERO,
            connection_status: ConnectionStatus::Unknown,
        }
    }
}

impl HealthMetrics {
    /// Folds one call outcome into the metrics and recomputes the status.
    pub fn record(
        &mut self,
        success: bool,
        response_time: Duration,
        max_consecutive_failures: u32,
        max_response_time: Duration,
    ) {
        self.total_calls += 1;
        if success {
            self.consecutive_failures = 0;
            self.last_successful_call = Some(Instant::now());
            self.last_successful_timestamp = Some(unix_timestamp());
        } else {
            self.failed_calls += 1;
            self.consecutive_failures += 1;
        }

        let total = self.total_calls as u128;
        self.avg_response_time = Duration::from_nanos(
            ((self.avg_response_time.as_nanos() * (total - 1) + response_time.as_nanos()) / total)
                as u64,
        );

        self.connection_status = if self.consecutive_failures >= max_consecutive_failures {
            ConnectionStatus::Unhealthy
        } else if self.consecutive_failures > 0 || self.avg_response_time > max_response_time {
            ConnectionStatus::Degraded
        } else {
            ConnectionStatus::Healthy
        };
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        (self.total_calls - self.failed_calls) as f64 / self.total_calls as f64
    }
}
