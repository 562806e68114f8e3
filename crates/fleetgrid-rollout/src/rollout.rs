//! The rollout record: request, phase, cohorts, and operator controls.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fleetgrid_state::{
    CohortSet, FleetError, FleetResult, RolloutId, Timestamp, Version, WorkerId,
};

use crate::strategy::RolloutStrategy;

/// A request to roll a new version into the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutSpec {
    pub target_version: Version,
    #[serde(default)]
    pub strategy: RolloutStrategy,
    /// Hold in `Pending` until an operator approves.
    #[serde(default)]
    pub approval_required: bool,
    /// Seconds to wait for approval. `None` waits indefinitely.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: Option<u64>,
}

fn default_approval_timeout() -> Option<u64> {
    Some(24 * 60 * 60)
}

impl RolloutSpec {
    pub fn new(target_version: &str, strategy: RolloutStrategy) -> Self {
        Self {
            target_version: target_version.to_string(),
            strategy,
            approval_required: false,
            approval_timeout_secs: default_approval_timeout(),
        }
    }

    /// Require approval, waiting at most `timeout_secs` for it.
    pub fn with_approval(mut self, timeout_secs: Option<u64>) -> Self {
        self.approval_required = true;
        self.approval_timeout_secs = timeout_secs;
        self
    }

    /// Validate against the fleet's current stable version.
    pub fn validate(&self, stable_version: &str) -> FleetResult<()> {
        if self.target_version.is_empty() {
            return Err(FleetError::Config(
                "target version must not be empty".to_string(),
            ));
        }
        if self.target_version == stable_version {
            return Err(FleetError::Config(format!(
                "fleet already runs {stable_version}"
            )));
        }
        self.strategy.validate()
    }
}

// ── Phase ─────────────────────────────────────────────────────────

/// Current phase of a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Created, waiting for the first tick or for approval.
    Pending,
    /// Provisioning or replacing workers.
    InProgress,
    /// Observing the current configuration before the next move.
    Baking,
    Completed,
    Failed { reason: String },
    RolledBack { reason: String },
}

impl RolloutPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::RolledBack { .. }
        )
    }
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Baking => write!(f, "baking"),
            Self::Completed => write!(f, "completed"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::RolledBack { reason } => write!(f, "rolled back: {reason}"),
        }
    }
}

// ── Rollout ───────────────────────────────────────────────────────

/// Strategy bookkeeping carried between ticks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Index into the canary step list.
    pub step: usize,
    /// When the current phase (or canary step) began.
    pub since: Timestamp,
    /// Bonus capacity currently held by this rollout.
    pub bonus: u32,
    pub bonus_claimed: bool,
}

/// Restoration of the baseline after a failure or rollback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Restore {
    /// The baseline has not been fully restored yet.
    pub pending: bool,
    /// Restoration ticks whose driver calls did not all succeed.
    pub attempts: u32,
}

/// A rollout of `target_version` over `baseline_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub id: RolloutId,
    pub target_version: Version,
    pub baseline_version: Version,
    pub strategy: RolloutStrategy,
    pub phase: RolloutPhase,
    pub cohorts: CohortSet,
    pub approval_required: bool,
    pub approved: bool,
    pub approval_timeout_secs: Option<u64>,
    pub cancel_requested: bool,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub progress: Progress,
    pub restore: Restore,
}

impl Rollout {
    /// Create a pending rollout whose baseline cohort holds `baseline_workers`
    /// at weight 100.
    pub fn new<I>(
        id: &str,
        spec: RolloutSpec,
        baseline_version: &str,
        baseline_workers: I,
        now: Timestamp,
    ) -> Self
    where
        I: IntoIterator<Item = WorkerId>,
    {
        let mut cohorts = CohortSet::single(baseline_version, baseline_workers);
        cohorts.ensure(&spec.target_version);
        Self {
            id: id.to_string(),
            target_version: spec.target_version,
            baseline_version: baseline_version.to_string(),
            strategy: spec.strategy,
            phase: RolloutPhase::Pending,
            cohorts,
            approval_required: spec.approval_required,
            approved: false,
            approval_timeout_secs: spec.approval_timeout_secs,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            progress: Progress::default(),
            restore: Restore::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Approve a rollout held for approval.
    pub fn approve(&mut self) -> FleetResult<()> {
        if self.phase != RolloutPhase::Pending {
            return Err(FleetError::Conflict(format!(
                "rollout {} is {}, not pending",
                self.id, self.phase
            )));
        }
        if !self.approval_required || self.approved {
            return Err(FleetError::Conflict(format!(
                "rollout {} is not awaiting approval",
                self.id
            )));
        }
        self.approved = true;
        info!(rollout = %self.id, "rollout approved");
        Ok(())
    }

    /// Ask for the rollout to be rolled back at the next tick.
    pub fn request_cancel(&mut self) -> FleetResult<()> {
        if self.is_terminal() {
            return Err(FleetError::Conflict(format!(
                "rollout {} already {}",
                self.id, self.phase
            )));
        }
        self.cancel_requested = true;
        info!(rollout = %self.id, phase = %self.phase, "rollout cancellation requested");
        Ok(())
    }

    /// Version that capacity added during this rollout is created at.
    pub fn fill_version(&self) -> &str {
        match (&self.strategy, &self.phase) {
            (RolloutStrategy::Rolling(_), RolloutPhase::InProgress | RolloutPhase::Baking) => {
                &self.target_version
            }
            (RolloutStrategy::BlueGreen(_), RolloutPhase::Baking) => &self.target_version,
            _ => &self.baseline_version,
        }
    }

    /// Weights with `target_percent` on the target and the rest on the baseline.
    pub fn split(&self, target_percent: u8) -> BTreeMap<Version, u8> {
        let target_percent = target_percent.min(100);
        BTreeMap::from([
            (self.baseline_version.clone(), 100 - target_percent),
            (self.target_version.clone(), target_percent),
        ])
    }

    pub(crate) fn begin(&mut self, now: Timestamp) {
        self.started_at = Some(now);
        self.enter(RolloutPhase::InProgress, now);
        info!(
            rollout = %self.id,
            strategy = self.strategy.name(),
            from = %self.baseline_version,
            to = %self.target_version,
            "rollout started"
        );
    }

    pub(crate) fn enter(&mut self, phase: RolloutPhase, now: Timestamp) {
        self.phase = phase;
        self.progress.since = now;
    }

    pub(crate) fn complete(&mut self, now: Timestamp) {
        self.phase = RolloutPhase::Completed;
        self.finished_at = Some(now);
        info!(rollout = %self.id, version = %self.target_version, "rollout completed");
    }

    /// Move to `Failed` and schedule restoration of the baseline.
    ///
    /// On a rollout that is already terminal this only re-arms restoration.
    pub fn fail(&mut self, now: Timestamp, reason: &str) {
        if !self.is_terminal() {
            self.phase = RolloutPhase::Failed {
                reason: reason.to_string(),
            };
            self.finished_at = Some(now);
            warn!(rollout = %self.id, %reason, "rollout failed");
        }
        self.restore.pending = true;
    }

    /// Move to `RolledBack` and schedule restoration of the baseline.
    pub fn roll_back(&mut self, now: Timestamp, reason: &str) {
        if !self.is_terminal() {
            self.phase = RolloutPhase::RolledBack {
                reason: reason.to_string(),
            };
            self.finished_at = Some(now);
            warn!(rollout = %self.id, %reason, "rolling back");
        }
        self.restore.pending = true;
    }

    /// Record that the baseline has been restored.
    pub fn restored(&mut self) {
        self.restore.pending = false;
        info!(rollout = %self.id, version = %self.baseline_version, "baseline restored");
    }

    /// Operator-facing summary.
    pub fn view(&self) -> RolloutView {
        let canary_step = match &self.strategy {
            RolloutStrategy::Canary(cfg) => cfg.steps.get(self.progress.step).copied(),
            _ => None,
        };
        RolloutView {
            id: self.id.clone(),
            target_version: self.target_version.clone(),
            baseline_version: self.baseline_version.clone(),
            strategy: self.strategy.name().to_string(),
            phase: self.phase.clone(),
            weights: self.cohorts.weights(),
            cohort_sizes: self
                .cohorts
                .iter()
                .map(|(v, c)| (v.clone(), c.workers.len()))
                .collect(),
            canary_step,
            approval_required: self.approval_required,
            approved: self.approved,
            restore_pending: self.restore.pending,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read-only rollout status returned by the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutView {
    pub id: RolloutId,
    pub target_version: Version,
    pub baseline_version: Version,
    pub strategy: String,
    pub phase: RolloutPhase,
    pub weights: BTreeMap<Version, u8>,
    pub cohort_sizes: BTreeMap<Version, usize>,
    /// Current canary traffic step, if this is a canary.
    pub canary_step: Option<u8>,
    pub approval_required: bool,
    pub approved: bool,
    pub restore_pending: bool,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}
