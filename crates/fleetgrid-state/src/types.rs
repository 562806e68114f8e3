//! Domain types for workers and their lifecycle.
//!
//! Identifiers are plain strings: worker ids are handed out by the fleet
//! driver, versions are opaque tags, rollout ids are minted by the
//! reconciler.

use serde::{Deserialize, Serialize};

/// Identifier of a worker, assigned by the fleet driver.
pub type WorkerId = String;

/// Workload version tag (e.g. "v2", an image digest).
pub type Version = String;

/// Identifier of a rollout.
pub type RolloutId = String;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

// ── Worker ────────────────────────────────────────────────────────

/// A single worker in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub id: WorkerId,
    pub version: Version,
    pub lifecycle: WorkerLifecycle,
    pub health: HealthStatus,
    /// Unix timestamp when the driver reported the worker created.
    pub created_at: Timestamp,
}

impl Worker {
    /// A freshly created worker, not yet reporting ready.
    pub fn provisioning(id: &str, version: &str, created_at: Timestamp) -> Self {
        Self {
            id: id.to_string(),
            version: version.to_string(),
            lifecycle: WorkerLifecycle::Provisioning,
            health: HealthStatus::Unknown,
            created_at,
        }
    }

    /// Provisioning or Ready: counts toward capacity.
    pub fn is_live(&self) -> bool {
        matches!(
            self.lifecycle,
            WorkerLifecycle::Provisioning | WorkerLifecycle::Ready
        )
    }

    /// Ready and not marked unhealthy by the probe.
    pub fn is_ready(&self) -> bool {
        self.lifecycle == WorkerLifecycle::Ready && self.health != HealthStatus::Unhealthy
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLifecycle {
    Provisioning,
    Ready,
    Draining,
    Terminated,
}

/// Health status as determined by probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for WorkerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}
