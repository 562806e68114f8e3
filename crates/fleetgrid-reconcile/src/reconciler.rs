//! The reconciler: sole writer of the fleet record.
//!
//! One [`Reconciler::tick`] refreshes worker health, collects a scaling
//! decision and a rollout proposal, applies them to a [`Plan`] in that
//! order, validates the plan, and only then issues driver calls. Driver
//! outcomes are committed action by action, so the fleet record always
//! reflects what the driver acknowledged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use fleetgrid_autoscale::{Autoscaler, ScalingDecision};
use fleetgrid_health::{HealthConfig, HealthProbe, HealthTracker};
use fleetgrid_metrics::{MetricSource, render_prometheus};
use fleetgrid_rollout::{Rollout, RolloutEngine, RolloutPhase, RolloutSpec, RolloutView};
use fleetgrid_state::{
    FleetError, FleetResult, FleetState, FleetStore, RolloutId, ScalingPolicy, Timestamp,
    Version, Worker, WorkerId, WorkerLifecycle, check_invariants,
};

use crate::config::ReconcilerConfig;
use crate::driver::{DriverError, DriverExecutor, FleetDriver, IdempotencyToken};
use crate::plan::{Action, Origin, Plan};

/// Rollout ids whose cancellation was requested, shared with control handles
/// so in-flight creates can observe a cancel before the loop processes it.
#[derive(Debug, Clone, Default)]
pub struct CancelBoard(Arc<Mutex<HashSet<RolloutId>>>);

impl CancelBoard {
    pub fn request(&self, id: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    pub fn is_requested(&self, id: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn clear(&self, id: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub now: Timestamp,
    pub scaling: Option<ScalingDecision>,
    /// Active rollout and its phase after the tick.
    pub rollout: Option<(RolloutId, RolloutPhase)>,
    /// Actions the driver acknowledged, in execution order.
    pub applied: Vec<Action>,
    pub failures: Vec<String>,
    /// Set when the plan violated an invariant and nothing was applied.
    pub conflict: Option<String>,
    pub pruned: usize,
}

/// Read-only fleet status returned by the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetView {
    pub stable_version: Version,
    pub desired_capacity: u32,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub live: u32,
    pub ready: u32,
    pub workers: Vec<Worker>,
    pub traffic: BTreeMap<Version, u8>,
    pub last_scale_action: Option<Timestamp>,
    pub last_decision: Option<ScalingDecision>,
    pub policy: Option<ScalingPolicy>,
    pub active_rollout: Option<RolloutView>,
}

/// Outcome of executing the rollout's part of a plan.
#[derive(Default)]
struct RolloutOutcome {
    /// First driver failure of a forward rollout action.
    failure: Option<String>,
    /// A restoration action failed.
    restore_failed: bool,
}

/// Arbitrates autoscaler and rollout proposals and applies them.
pub struct Reconciler {
    state: FleetState,
    rollouts: BTreeMap<RolloutId, Rollout>,
    policy: Option<ScalingPolicy>,
    pending_override: Option<u32>,
    autoscaler: Autoscaler,
    engine: RolloutEngine,
    metrics: Arc<dyn MetricSource>,
    probe: Arc<dyn HealthProbe>,
    executor: DriverExecutor,
    health: HealthConfig,
    trackers: HashMap<WorkerId, HealthTracker>,
    config: ReconcilerConfig,
    cancels: CancelBoard,
    store: Option<FleetStore>,
    ticks: u64,
    rollout_seq: u64,
}

impl Reconciler {
    pub fn new(
        state: FleetState,
        metrics: Arc<dyn MetricSource>,
        probe: Arc<dyn HealthProbe>,
        driver: Arc<dyn FleetDriver>,
        config: ReconcilerConfig,
    ) -> Self {
        let executor = DriverExecutor::new(
            driver,
            config.driver_timeout(),
            config.max_attempts,
            config.backoff(),
        );
        Self {
            state,
            rollouts: BTreeMap::new(),
            policy: None,
            pending_override: None,
            autoscaler: Autoscaler::new(),
            engine: RolloutEngine::new(),
            metrics,
            probe,
            executor,
            health: HealthConfig::default(),
            trackers: HashMap::new(),
            config,
            cancels: CancelBoard::default(),
            store: None,
            ticks: 0,
            rollout_seq: 0,
        }
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_policy(mut self, policy: ScalingPolicy) -> FleetResult<Self> {
        self.set_policy(Some(policy))?;
        Ok(self)
    }

    /// Checkpoint to `store`, resuming from its last checkpoint if it has one.
    pub fn with_store(mut self, store: FleetStore) -> FleetResult<Self> {
        let tick = store.load_tick()?;
        if let Some(state) = store.load_fleet()? {
            let rollouts: Vec<Rollout> = store.list_rollouts()?;
            info!(
                workers = state.workers.len(),
                rollouts = rollouts.len(),
                tick,
                active = ?state.active_rollout,
                "resuming from checkpoint"
            );
            self.rollout_seq = rollouts
                .iter()
                .filter_map(|r| r.id.strip_prefix("ro-")?.parse::<u64>().ok())
                .max()
                .unwrap_or(0);
            self.rollouts = rollouts.into_iter().map(|r| (r.id.clone(), r)).collect();
            self.state = state;
        }
        // Token numbering continues where the last incarnation stopped.
        self.ticks = self.ticks.max(tick);
        self.store = Some(store);
        self.persist(None);
        Ok(self)
    }

    pub fn state(&self) -> &FleetState {
        &self.state
    }

    pub fn rollout(&self, id: &str) -> Option<&Rollout> {
        self.rollouts.get(id)
    }

    pub fn cancel_board(&self) -> CancelBoard {
        self.cancels.clone()
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn active(&self) -> Option<&Rollout> {
        self.state
            .active_rollout
            .as_ref()
            .and_then(|id| self.rollouts.get(id))
    }

    // ── Commands ──────────────────────────────────────────────────

    /// Create a rollout. Rejected while another rollout is active.
    pub fn start_rollout(&mut self, spec: RolloutSpec, now: Timestamp) -> FleetResult<RolloutId> {
        if let Some(active) = &self.state.active_rollout {
            return Err(FleetError::Conflict(format!(
                "rollout {active} is still active"
            )));
        }
        spec.validate(&self.state.stable_version)?;

        self.rollout_seq += 1;
        let id = format!("ro-{}", self.rollout_seq);
        let stable = self.state.stable_version.clone();
        let baseline: Vec<WorkerId> = self
            .state
            .live_of_version(&stable)
            .map(|w| w.id.clone())
            .collect();
        let rollout = Rollout::new(&id, spec, &stable, baseline, now);
        info!(
            rollout = %id,
            target = %rollout.target_version,
            strategy = rollout.strategy.name(),
            approval = rollout.approval_required,
            "rollout created"
        );
        self.rollouts.insert(id.clone(), rollout);
        self.state.active_rollout = Some(id.clone());
        self.persist(Some(&id));
        Ok(id)
    }

    pub fn approve(&mut self, id: &str) -> FleetResult<()> {
        self.rollouts
            .get_mut(id)
            .ok_or_else(|| FleetError::NotFound(format!("rollout {id}")))?
            .approve()?;
        self.persist(Some(id));
        Ok(())
    }

    /// Request cancellation; the rollout is rolled back at the next tick.
    pub fn cancel(&mut self, id: &str) -> FleetResult<()> {
        self.rollouts
            .get_mut(id)
            .ok_or_else(|| FleetError::NotFound(format!("rollout {id}")))?
            .request_cancel()?;
        self.cancels.request(id);
        self.persist(Some(id));
        Ok(())
    }

    pub fn rollout_status(&self, id: &str) -> FleetResult<RolloutView> {
        self.rollouts
            .get(id)
            .map(Rollout::view)
            .ok_or_else(|| FleetError::NotFound(format!("rollout {id}")))
    }

    pub fn rollouts(&self) -> Vec<RolloutView> {
        self.rollouts.values().map(Rollout::view).collect()
    }

    pub fn fleet_status(&self) -> FleetView {
        FleetView {
            stable_version: self.state.stable_version.clone(),
            desired_capacity: self.state.desired_capacity,
            min_capacity: self.state.min_capacity,
            max_capacity: self.state.max_capacity,
            live: self.state.live_count(),
            ready: self.state.live_workers().filter(|w| w.is_ready()).count() as u32,
            workers: self.state.workers.clone(),
            traffic: self.state.traffic.clone(),
            last_scale_action: self.state.last_scale_action,
            last_decision: self.autoscaler.last_decision().cloned(),
            policy: self.policy.clone(),
            active_rollout: self.active().map(Rollout::view),
        }
    }

    /// Prometheus exposition of the fleet, with the weights last
    /// acknowledged by the driver.
    pub fn exposition(&self) -> String {
        render_prometheus(&self.state, Some(&self.state.traffic))
    }

    /// Replace (or clear) the scaling policy.
    pub fn set_policy(&mut self, policy: Option<ScalingPolicy>) -> FleetResult<()> {
        if let Some(policy) = &policy {
            policy.validate()?;
        }
        info!(enabled = policy.is_some(), "scaling policy updated");
        self.policy = policy;
        Ok(())
    }

    pub fn set_bounds(&mut self, min: u32, max: u32) -> FleetResult<()> {
        self.state.set_bounds(min, max)?;
        info!(min, max, desired = self.state.desired_capacity, "capacity bounds updated");
        self.persist(None);
        Ok(())
    }

    /// Override desired capacity; applied at the start of the next tick.
    pub fn override_capacity(&mut self, desired: u32) -> FleetResult<()> {
        if desired < self.state.min_capacity || desired > self.state.max_capacity {
            return Err(FleetError::Config(format!(
                "desired capacity {desired} outside [{}, {}]",
                self.state.min_capacity, self.state.max_capacity
            )));
        }
        self.pending_override = Some(desired);
        Ok(())
    }

    // ── Tick ──────────────────────────────────────────────────────

    /// Run one reconciliation pass.
    pub async fn tick(&mut self, now: Timestamp) -> TickReport {
        self.ticks += 1;
        let tick = self.ticks;
        let mut report = TickReport {
            tick,
            now,
            ..Default::default()
        };

        self.refresh_health();

        let decision = self.scaling_decision(now);
        let mut plan = Plan::new(&self.state, self.active(), now);
        if let Some(decision) = &decision {
            plan.apply_scaling(decision);
        }
        let mut restoring = false;
        if let Some(rollout) = plan.rollout.as_mut()
            && let Some(proposal) =
                self.engine
                    .step(now, rollout, &plan.state, self.metrics.as_ref())
        {
            restoring = proposal.restoration;
            plan.apply_proposal(proposal);
        }
        plan.repair();
        report.scaling = decision;

        if let Err(e) = plan.validate() {
            warn!(tick, error = %e, "plan rejected, nothing applied");
            report.conflict = Some(e.to_string());
            report.rollout = self.active().map(|r| (r.id.clone(), r.phase.clone()));
            return report;
        }

        if !plan.actions.is_empty() {
            debug!(tick, actions = plan.actions.len(), "executing plan");
        }
        let rollout_id = plan.rollout.as_ref().map(|r| r.id.clone());
        let outcome = self.execute(plan, tick, now, restoring, &mut report).await;
        if let Some(id) = &rollout_id {
            self.settle_rollout(id, now, outcome, restoring);
        }

        report.pruned = self.state.prune_terminated();
        let state = &self.state;
        self.trackers.retain(|id, _| state.worker(id).is_some());

        let cohorts = self.active().map(|r| &r.cohorts);
        if let Err(e) = check_invariants(&self.state, cohorts) {
            error!(tick, error = %e, "committed state violates invariants");
        }

        self.persist(rollout_id.as_deref());
        report.rollout = rollout_id
            .and_then(|id| self.rollouts.get(&id).map(|r| (id, r.phase.clone())));
        report
    }

    fn refresh_health(&mut self) {
        for worker in self.state.workers.iter_mut() {
            if worker.lifecycle == WorkerLifecycle::Terminated {
                continue;
            }
            let status = self.probe.check(&worker.id);
            let tracker = self
                .trackers
                .entry(worker.id.clone())
                .or_insert_with(|| HealthTracker::new(&self.health));
            let health = tracker.record(status.into());
            if health != worker.health {
                debug!(worker = %worker.id, from = ?worker.health, to = ?health, "worker health changed");
                worker.health = health;
            }
            if worker.lifecycle == WorkerLifecycle::Provisioning && status.ready && status.live {
                worker.lifecycle = WorkerLifecycle::Ready;
                info!(worker = %worker.id, version = %worker.version, "worker ready");
            }
        }
    }

    fn scaling_decision(&mut self, now: Timestamp) -> Option<ScalingDecision> {
        if let Some(desired) = self.pending_override.take() {
            let desired = self.state.clamp(i64::from(desired));
            info!(from = self.state.desired_capacity, to = desired, "applying capacity override");
            return Some(ScalingDecision::manual(self.state.desired_capacity, desired));
        }
        let policy = self.policy.as_ref()?;
        Some(
            self.autoscaler
                .evaluate(now, self.metrics.as_ref(), policy, &self.state),
        )
    }

    /// Execute a validated plan, committing each acknowledged action.
    async fn execute(
        &mut self,
        plan: Plan,
        tick: u64,
        now: Timestamp,
        restoring: bool,
        report: &mut TickReport,
    ) -> RolloutOutcome {
        let Plan {
            state: planned,
            rollout: planned_rollout,
            actions,
            ..
        } = plan;
        let rollout_id = planned_rollout.as_ref().map(|r| r.id.clone());

        self.state.desired_capacity = planned.desired_capacity;
        self.state.last_scale_action = planned.last_scale_action;

        // Carry the rollout's phase and progress forward. Cohort membership
        // and weights only change as the driver acknowledges actions.
        if let (Some(id), Some(mut next)) = (&rollout_id, planned_rollout)
            && let Some(current) = self.rollouts.get_mut(id)
        {
            next.cohorts = std::mem::take(&mut current.cohorts);
            *current = next;
        }

        let mut outcome = RolloutOutcome::default();
        let mut slots: HashMap<WorkerId, WorkerId> = HashMap::new();

        for (seq, action) in actions.into_iter().enumerate() {
            let origin = action.origin();
            if origin == Origin::Rollout && outcome.failure.is_some() {
                debug!(tick, ?action, "skipping rollout action after failure");
                continue;
            }
            let token = IdempotencyToken::new(tick, seq);

            let result = match &action {
                Action::Create { version, slot, .. } => {
                    self.executor.create(version, &token).await.map(|id| {
                        self.commit_create(&id, version, now, origin, restoring, rollout_id.as_deref());
                        slots.insert(slot.clone(), id);
                    })
                }
                Action::Terminate { worker, .. } => {
                    let worker = slots.get(worker).cloned().unwrap_or_else(|| worker.clone());
                    if Plan::is_placeholder(&worker) {
                        continue;
                    }
                    let result = self.executor.terminate(&worker, &token).await;
                    self.commit_terminate(&worker, result.is_ok(), rollout_id.as_deref());
                    result
                }
                Action::SetWeights { weights, .. } => {
                    self.executor
                        .set_cohort_weights(weights, &token)
                        .await
                        .map(|()| self.commit_weights(weights, origin, rollout_id.as_deref()))
                }
                Action::Drain { worker } => {
                    if let Some(w) = self.state.worker_mut(worker)
                        && w.is_live()
                    {
                        w.lifecycle = WorkerLifecycle::Draining;
                        debug!(worker = %w.id, "worker draining");
                    }
                    Ok(())
                }
                Action::Reinstate { worker } => {
                    if let Some(w) = self.state.worker_mut(worker)
                        && w.lifecycle == WorkerLifecycle::Draining
                    {
                        w.lifecycle = WorkerLifecycle::Ready;
                        debug!(worker = %w.id, "worker reinstated");
                    }
                    Ok(())
                }
            };

            match result {
                Ok(()) => report.applied.push(action),
                Err(e) => self.record_failure(tick, &action, e, restoring, &mut outcome, report),
            }
        }
        outcome
    }

    fn commit_create(
        &mut self,
        id: &str,
        version: &str,
        now: Timestamp,
        origin: Origin,
        restoring: bool,
        rollout_id: Option<&str>,
    ) {
        if self.state.worker(id).is_some() {
            warn!(worker = %id, %version, "driver returned a worker id already in the fleet, ignoring");
            return;
        }
        let mut worker = Worker::provisioning(id, version, now);
        if let Some(rid) = rollout_id
            && let Some(rollout) = self.rollouts.get_mut(rid)
        {
            rollout.cohorts.admit(version, id);
            if origin == Origin::Rollout && !restoring && self.cancels.is_requested(rid) {
                worker.lifecycle = WorkerLifecycle::Draining;
                info!(worker = %id, rollout = %rid, "worker created after cancellation, draining");
            }
        }
        debug!(worker = %id, %version, %origin, "worker created");
        self.state.push_worker(worker);
    }

    fn commit_terminate(&mut self, id: &str, acknowledged: bool, rollout_id: Option<&str>) {
        let Some(worker) = self.state.worker_mut(id) else {
            return;
        };
        if acknowledged {
            worker.lifecycle = WorkerLifecycle::Terminated;
            debug!(worker = %id, "worker terminated");
            if let Some(rollout) = rollout_id.and_then(|rid| self.rollouts.get_mut(rid)) {
                rollout.cohorts.evict(id);
            }
            self.trackers.remove(id);
        } else if worker.is_live() {
            // Out of rotation; drift repair or restoration retries the termination.
            worker.lifecycle = WorkerLifecycle::Draining;
        }
    }

    fn commit_weights(&mut self, weights: &BTreeMap<Version, u8>, origin: Origin, rollout_id: Option<&str>) {
        self.state.traffic = weights.clone();
        if origin == Origin::Rollout
            && let Some(rollout) = rollout_id.and_then(|rid| self.rollouts.get_mut(rid))
        {
            rollout.cohorts.set_weights(weights);
        }
        info!(?weights, %origin, "cohort weights applied");
    }

    fn record_failure(
        &self,
        tick: u64,
        action: &Action,
        err: DriverError,
        restoring: bool,
        outcome: &mut RolloutOutcome,
        report: &mut TickReport,
    ) {
        let origin = action.origin();
        let message = match action {
            Action::Create { version, .. } => format!("create {version}: {err}"),
            Action::Terminate { worker, .. } => format!("terminate {worker}: {err}"),
            Action::SetWeights { .. } => format!("set cohort weights: {err}"),
            Action::Drain { .. } | Action::Reinstate { .. } => err.to_string(),
        };
        warn!(tick, %origin, error = %err, action = %message, "driver action failed");
        if origin == Origin::Rollout {
            if restoring {
                outcome.restore_failed = true;
            } else if outcome.failure.is_none() {
                outcome.failure = Some(FleetError::from(err).to_string());
            }
        }
        report.failures.push(message);
    }

    /// Finalize the rollout after execution: fail it on driver errors,
    /// promote the target on completion, release it once restored.
    fn settle_rollout(&mut self, id: &str, now: Timestamp, outcome: RolloutOutcome, restoring: bool) {
        let max_restore_attempts = self.config.max_restore_attempts;
        let Some(rollout) = self.rollouts.get_mut(id) else {
            return;
        };

        if let Some(reason) = outcome.failure
            && rollout.phase != RolloutPhase::Completed
        {
            rollout.fail(now, &reason);
        }

        let release = match &rollout.phase {
            RolloutPhase::Completed => {
                self.state.stable_version = rollout.target_version.clone();
                info!(rollout = %id, version = %rollout.target_version, "stable version promoted");
                true
            }
            RolloutPhase::Failed { .. } | RolloutPhase::RolledBack { .. } if restoring => {
                if !outcome.restore_failed {
                    rollout.restored();
                    true
                } else {
                    rollout.restore.attempts += 1;
                    if rollout.restore.attempts >= max_restore_attempts {
                        error!(
                            rollout = %id,
                            attempts = rollout.restore.attempts,
                            "restoration abandoned, leaving the fleet to drift repair"
                        );
                        rollout.restore.pending = false;
                        true
                    } else {
                        warn!(rollout = %id, attempts = rollout.restore.attempts, "restoration incomplete, retrying next tick");
                        false
                    }
                }
            }
            _ => false,
        };

        if release {
            self.state.active_rollout = None;
            self.cancels.clear(id);
        }
    }

    fn persist(&self, rollout_id: Option<&str>) {
        let Some(store) = &self.store else {
            return;
        };
        let touched: Vec<(&str, &Rollout)> = rollout_id
            .and_then(|id| self.rollouts.get_key_value(id))
            .map(|(id, r)| (id.as_str(), r))
            .into_iter()
            .collect();
        if let Err(e) = store.checkpoint(&self.state, self.ticks, &touched) {
            warn!(error = %e, "fleet checkpoint failed");
        }
    }
}
