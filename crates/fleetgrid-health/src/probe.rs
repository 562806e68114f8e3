//! The health probe interface and an in-memory board.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleetgrid_state::WorkerId;

/// Liveness and readiness of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProbeStatus {
    pub ready: bool,
    pub live: bool,
}

impl ProbeStatus {
    pub const READY: Self = Self {
        ready: true,
        live: true,
    };

    pub const STARTING: Self = Self {
        ready: false,
        live: true,
    };

    pub const DOWN: Self = Self {
        ready: false,
        live: false,
    };
}

/// Supplies pass/fail status per worker.
pub trait HealthProbe: Send + Sync {
    fn check(&self, worker: &str) -> ProbeStatus;
}

/// Probe results reported by an external agent and read by the reconciler.
///
/// Workers that were never reported return `default_status`.
#[derive(Debug)]
pub struct ProbeBoard {
    statuses: RwLock<HashMap<WorkerId, ProbeStatus>>,
    default_status: ProbeStatus,
}

impl Default for ProbeBoard {
    fn default() -> Self {
        Self::new(ProbeStatus::STARTING)
    }
}

impl ProbeBoard {
    pub fn new(default_status: ProbeStatus) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            default_status,
        }
    }

    /// Record the latest status of a worker.
    pub fn report(&self, worker: &str, status: ProbeStatus) {
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        if statuses.insert(worker.to_string(), status) != Some(status) {
            debug!(%worker, ready = status.ready, live = status.live, "probe status changed");
        }
    }

    /// Mark every listed worker ready.
    pub fn mark_ready<'a, I>(&self, workers: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for w in workers {
            self.report(w, ProbeStatus::READY);
        }
    }

    /// Forget a worker.
    pub fn remove(&self, worker: &str) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker);
    }
}

impl HealthProbe for ProbeBoard {
    fn check(&self, worker: &str) -> ProbeStatus {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker)
            .copied()
            .unwrap_or(self.default_status)
    }
}
