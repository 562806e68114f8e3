//! Reconciler tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::BackoffPolicy;

/// Timing and retry settings of the reconciliation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Seconds between periodic ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Upper bound on a single driver call.
    #[serde(default = "default_driver_timeout")]
    pub driver_timeout_ms: u64,
    /// Attempts per driver call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Ticks a failed restoration is retried before drift repair takes over.
    #[serde(default = "default_max_restore_attempts")]
    pub max_restore_attempts: u32,
    /// Depth of the controller's event queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_tick_interval() -> u64 {
    10
}

fn default_driver_timeout() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    200
}

fn default_backoff_max() -> u64 {
    5_000
}

fn default_max_restore_attempts() -> u32 {
    5
}

fn default_queue_depth() -> usize {
    256
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            driver_timeout_ms: default_driver_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            max_restore_attempts: default_max_restore_attempts(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl ReconcilerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms.max(1))
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}
