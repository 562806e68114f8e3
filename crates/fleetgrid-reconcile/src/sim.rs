//! In-memory fleet driver for tests and the daemon's simulated mode.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use fleetgrid_health::{ProbeBoard, ProbeStatus};
use fleetgrid_state::{Version, WorkerId};

use crate::driver::{DriverError, FleetDriver, IdempotencyToken};

/// One call received by the [`SimDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    Create { version: Version, token: String },
    Terminate { worker: WorkerId, token: String },
    SetWeights { weights: BTreeMap<Version, u8>, token: String },
}

#[derive(Debug, Default)]
struct SimInner {
    next_id: u64,
    running: BTreeMap<WorkerId, Version>,
    weights: BTreeMap<Version, u8>,
    /// Create results by token, so retries do not double-provision.
    created: HashMap<String, WorkerId>,
    failures: VecDeque<DriverError>,
    failing_versions: HashMap<Version, DriverError>,
    calls: Vec<SimCall>,
    latency: Option<Duration>,
}

/// A driver that keeps workers and weights in memory.
///
/// Worker ids are `w-1`, `w-2`, ... With a [`ProbeBoard`] attached, created
/// workers report ready immediately and terminated ones are forgotten.
#[derive(Debug, Default)]
pub struct SimDriver {
    inner: Mutex<SimInner>,
    probes: Option<Arc<ProbeBoard>>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report created workers ready on `probes`.
    pub fn with_probes(probes: Arc<ProbeBoard>) -> Self {
        Self {
            inner: Mutex::default(),
            probes: Some(probes),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` calls with `error`.
    pub fn fail_next(&self, count: usize, error: DriverError) {
        let mut inner = self.lock();
        inner.failures.extend(std::iter::repeat_n(error, count));
    }

    /// Fail every create of `version` with `error`.
    pub fn fail_version(&self, version: &str, error: DriverError) {
        self.lock().failing_versions.insert(version.to_string(), error);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.failing_versions.clear();
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Running workers and their versions.
    pub fn running(&self) -> BTreeMap<WorkerId, Version> {
        self.lock().running.clone()
    }

    pub fn running_of(&self, version: &str) -> usize {
        self.lock().running.values().filter(|v| *v == version).count()
    }

    /// Weights from the last successful `set_cohort_weights`.
    pub fn weights(&self) -> BTreeMap<Version, u8> {
        self.lock().weights.clone()
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Record a call and decide whether it fails. Returns the latency to apply.
    fn begin(&self, call: SimCall) -> (Option<Duration>, Result<(), DriverError>) {
        let mut inner = self.lock();
        let version_failure = match &call {
            SimCall::Create { version, .. } => inner.failing_versions.get(version).cloned(),
            _ => None,
        };
        inner.calls.push(call);
        let outcome = match inner.failures.pop_front().or(version_failure) {
            Some(err) => Err(err),
            None => Ok(()),
        };
        (inner.latency, outcome)
    }
}

#[async_trait]
impl FleetDriver for SimDriver {
    async fn create(&self, version: &str, token: &IdempotencyToken) -> Result<WorkerId, DriverError> {
        let (latency, outcome) = self.begin(SimCall::Create {
            version: version.to_string(),
            token: token.to_string(),
        });
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        outcome?;

        let id = {
            let mut inner = self.lock();
            if let Some(id) = inner.created.get(token.as_str()) {
                return Ok(id.clone());
            }
            inner.next_id += 1;
            let id = format!("w-{}", inner.next_id);
            inner.running.insert(id.clone(), version.to_string());
            inner.created.insert(token.to_string(), id.clone());
            id
        };
        if let Some(probes) = &self.probes {
            probes.report(&id, ProbeStatus::READY);
        }
        debug!(worker = %id, %version, %token, "sim worker created");
        Ok(id)
    }

    async fn terminate(&self, worker: &str, token: &IdempotencyToken) -> Result<(), DriverError> {
        let (latency, outcome) = self.begin(SimCall::Terminate {
            worker: worker.to_string(),
            token: token.to_string(),
        });
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        outcome?;

        self.lock().running.remove(worker);
        if let Some(probes) = &self.probes {
            probes.remove(worker);
        }
        debug!(%worker, %token, "sim worker terminated");
        Ok(())
    }

    async fn set_cohort_weights(
        &self,
        weights: &BTreeMap<Version, u8>,
        token: &IdempotencyToken,
    ) -> Result<(), DriverError> {
        let (latency, outcome) = self.begin(SimCall::SetWeights {
            weights: weights.clone(),
            token: token.to_string(),
        });
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        outcome?;

        let total: u32 = weights.values().map(|w| u32::from(*w)).sum();
        if total != 100 {
            return Err(DriverError::Rejected(format!("weights sum to {total}")));
        }
        self.lock().weights = weights.clone();
        Ok(())
    }
}
