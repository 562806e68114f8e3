//! Debounced health tracking.
//!
//! Turns a stream of raw liveness results into a [`HealthStatus`] with
//! configurable thresholds, so one failed probe is not enough to mark a
//! worker unhealthy.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use fleetgrid_state::HealthStatus;

use crate::probe::ProbeStatus;

/// Thresholds for health tracking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthConfig {
    /// Consecutive failed probes before a worker is marked unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Consecutive passing probes to recover.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    1
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

/// Result of a single liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy,
    Unhealthy,
}

impl From<ProbeStatus> for ProbeResult {
    fn from(status: ProbeStatus) -> Self {
        if status.live {
            Self::Healthy
        } else {
            Self::Unhealthy
        }
    }
}

/// Tracks consecutive probe results for a single worker.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
}

impl HealthTracker {
    /// Create a tracker from a health config.
    pub fn new(config: &HealthConfig) -> Self {
        Self::with_thresholds(config.unhealthy_threshold, config.healthy_threshold)
    }

    /// Create a tracker with explicit thresholds. Zero thresholds act as 1.
    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;

                if self.consecutive_successes >= self.healthy_threshold {
                    if self.status == HealthStatus::Unhealthy {
                        debug!(
                            successes = self.consecutive_successes,
                            "worker recovered to healthy"
                        );
                    }
                    self.status = HealthStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "worker marked unhealthy"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
