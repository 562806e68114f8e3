//! Rollout engine: drives the rollout state machine one tick at a time.
//!
//! The engine never touches the fleet. Each call to [`RolloutEngine::step`]
//! looks at the (planned) fleet, advances the rollout's phase, and returns
//! a [`RolloutProposal`] the reconciler validates and applies.

use std::collections::BTreeMap;

use tracing::{debug, info};

use fleetgrid_metrics::{MetricScope, MetricSource};
use fleetgrid_state::{FleetState, Timestamp, Version, Worker, WorkerId, WorkerLifecycle};

use crate::rollout::{Rollout, RolloutPhase};
use crate::strategy::{BlueGreenConfig, CanaryConfig, RollingConfig, RolloutStrategy};

/// Changes a rollout asks the reconciler to make in one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RolloutProposal {
    /// Bonus capacity claimed (positive) or released (negative).
    pub capacity_delta: i32,
    /// One entry per worker to create, admitted to that version's cohort.
    pub create: Vec<Version>,
    pub terminate: Vec<WorkerId>,
    /// Workers taken out of rotation but kept running.
    pub drain: Vec<WorkerId>,
    /// Draining workers put back into rotation.
    pub reinstate: Vec<WorkerId>,
    pub weights: Option<BTreeMap<Version, u8>>,
    /// This proposal restores the baseline after a failure or rollback.
    pub restoration: bool,
}

impl RolloutProposal {
    pub fn is_empty(&self) -> bool {
        self.capacity_delta == 0
            && self.create.is_empty()
            && self.terminate.is_empty()
            && self.drain.is_empty()
            && self.reinstate.is_empty()
            && self.weights.is_none()
            && !self.restoration
    }
}

/// Stateless driver of [`Rollout`] records.
#[derive(Debug, Default, Clone)]
pub struct RolloutEngine;

impl RolloutEngine {
    pub fn new() -> Self {
        Self
    }

    /// Advance `rollout` against `fleet` and return what should change.
    ///
    /// Returns `None` when the rollout is waiting (approval, readiness, a
    /// bake window) or finished.
    pub fn step(
        &self,
        now: Timestamp,
        rollout: &mut Rollout,
        fleet: &FleetState,
        metrics: &dyn MetricSource,
    ) -> Option<RolloutProposal> {
        if rollout.restore.pending {
            return Some(self.restore(rollout, fleet));
        }
        if rollout.is_terminal() {
            return None;
        }
        if rollout.cancel_requested {
            rollout.roll_back(now, "cancelled by operator");
            return Some(self.restore(rollout, fleet));
        }

        if rollout.phase == RolloutPhase::Pending {
            if rollout.approval_required && !rollout.approved {
                if let Some(timeout) = rollout.approval_timeout_secs
                    && now.saturating_sub(rollout.created_at) >= timeout
                {
                    rollout.fail(now, "approval timeout");
                    return Some(self.restore(rollout, fleet));
                }
                return None;
            }
            rollout.begin(now);
        }

        if let Some(reason) = overdue(now, rollout, fleet) {
            rollout.fail(now, &reason);
            return Some(self.restore(rollout, fleet));
        }

        let proposal = match rollout.strategy.clone() {
            RolloutStrategy::Rolling(cfg) => step_rolling(now, &cfg, rollout, fleet),
            RolloutStrategy::BlueGreen(cfg) => step_blue_green(now, &cfg, rollout, fleet),
            RolloutStrategy::Canary(cfg) => step_canary(now, &cfg, rollout, fleet, metrics),
        };

        if rollout.restore.pending {
            return Some(self.restore(rollout, fleet));
        }
        proposal.filter(|p| !p.is_empty())
    }

    /// Proposal restoring the last known-good configuration: baseline at
    /// full weight, target workers terminated, baseline workers recreated up
    /// to the base capacity, bonus capacity released.
    pub fn restore(&self, rollout: &mut Rollout, fleet: &FleetState) -> RolloutProposal {
        let baseline = rollout.baseline_version.clone();
        let release = release_bonus(rollout, fleet);
        let base = fleet.desired_capacity.saturating_sub(release);

        let reinstate: Vec<WorkerId> = rollout
            .cohorts
            .members(&baseline)
            .filter(|id| {
                fleet
                    .worker(id)
                    .is_some_and(|w| w.lifecycle == WorkerLifecycle::Draining)
            })
            .cloned()
            .collect();
        let baseline_live = fleet.live_of_version(&baseline).count() + reinstate.len();
        let missing = (base as usize).saturating_sub(baseline_live);

        let terminate: Vec<WorkerId> = rollout
            .cohorts
            .members(&rollout.target_version)
            .filter(|id| {
                fleet
                    .worker(id)
                    .is_some_and(|w| w.lifecycle != WorkerLifecycle::Terminated)
            })
            .cloned()
            .collect();

        debug!(
            rollout = %rollout.id,
            terminate = terminate.len(),
            reinstate = reinstate.len(),
            create = missing,
            release,
            "restoring baseline"
        );

        RolloutProposal {
            capacity_delta: -(release as i32),
            create: vec![baseline; missing],
            terminate,
            drain: Vec::new(),
            reinstate,
            weights: Some(rollout.split(0)),
            restoration: true,
        }
    }
}

/// Give back the rollout's bonus capacity, never dropping below the floor.
fn release_bonus(rollout: &mut Rollout, fleet: &FleetState) -> u32 {
    let release = rollout
        .progress
        .bonus
        .min(fleet.desired_capacity.saturating_sub(fleet.min_capacity));
    rollout.progress.bonus = 0;
    release
}

/// A target worker that has not become ready within the strategy's timeout.
fn overdue(now: Timestamp, rollout: &Rollout, fleet: &FleetState) -> Option<String> {
    let timeout = rollout.strategy.ready_timeout_secs();
    rollout
        .cohorts
        .members(&rollout.target_version)
        .filter_map(|id| fleet.worker(id))
        .find(|w| {
            w.lifecycle == WorkerLifecycle::Provisioning
                && now.saturating_sub(w.created_at) > timeout
        })
        .map(|w| format!("worker {} not ready within {timeout}s", w.id))
}

/// Rounded percentage of `part` in `total`.
fn percent(part: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((200 * u64::from(part) + u64::from(total)) / (2 * u64::from(total))).min(100) as u8
}

fn live_members<'a>(rollout: &'a Rollout, fleet: &'a FleetState, version: &'a str) -> Vec<&'a Worker> {
    rollout
        .cohorts
        .members(version)
        .filter_map(|id| fleet.worker(id))
        .filter(|w| w.lifecycle != WorkerLifecycle::Terminated)
        .collect()
}

fn changed(rollout: &Rollout, weights: BTreeMap<Version, u8>) -> Option<BTreeMap<Version, u8>> {
    (rollout.cohorts.weights() != weights).then_some(weights)
}

// ── Rolling ───────────────────────────────────────────────────────

fn step_rolling(
    now: Timestamp,
    cfg: &RollingConfig,
    rollout: &mut Rollout,
    fleet: &FleetState,
) -> Option<RolloutProposal> {
    if rollout.phase == RolloutPhase::Baking {
        if now.saturating_sub(rollout.progress.since) >= cfg.bake_secs {
            rollout.complete(now);
        }
        return None;
    }

    let target = rollout.target_version.clone();
    let baseline = rollout.baseline_version.clone();
    let desired = fleet.desired_capacity;

    let new_live = fleet.live_of_version(&target).count() as u32;
    let new_ready = fleet.ready_of_version(&target);
    let old = fleet.termination_candidates(|w| w.version != baseline);
    let old_ready = old.iter().filter(|w| w.is_ready()).count() as u32;

    let mut proposal = RolloutProposal::default();

    if old.is_empty() && new_ready == new_live {
        proposal.weights = changed(rollout, rollout.split(100));
        if cfg.bake_secs > 0 {
            rollout.enter(RolloutPhase::Baking, now);
            debug!(rollout = %rollout.id, bake_secs = cfg.bake_secs, "all workers replaced, baking");
        } else {
            rollout.complete(now);
        }
        return Some(proposal);
    }

    // Advance only once the previous replacement is ready.
    if new_ready < new_live {
        return None;
    }

    let available = new_ready + old_ready;
    let min_available = desired.saturating_sub(cfg.max_unavailable);
    let mut total = new_live + old.len() as u32;
    let mut old_ready_after = old_ready;

    if let Some(victim) = old.first()
        && (!victim.is_ready() || available > min_available)
    {
        proposal.terminate.push(victim.id.clone());
        total -= 1;
        if victim.is_ready() {
            old_ready_after -= 1;
        }
    }

    if new_live < desired && total < desired + cfg.max_surge {
        proposal.create.push(target);
    }

    if new_ready + old_ready_after > 0 {
        let share = percent(new_ready, new_ready + old_ready_after);
        proposal.weights = changed(rollout, rollout.split(share));
    }

    if !proposal.terminate.is_empty() || !proposal.create.is_empty() {
        debug!(
            rollout = %rollout.id,
            replaced = new_ready,
            remaining = old.len(),
            "rolling replacement"
        );
    }
    Some(proposal)
}

// ── Blue-green ────────────────────────────────────────────────────

fn step_blue_green(
    now: Timestamp,
    cfg: &BlueGreenConfig,
    rollout: &mut Rollout,
    fleet: &FleetState,
) -> Option<RolloutProposal> {
    let target = rollout.target_version.clone();
    let baseline = rollout.baseline_version.clone();
    let green_live = fleet.live_of_version(&target).count() as u32;
    let green_ready = fleet.ready_of_version(&target);

    if rollout.phase == RolloutPhase::Baking {
        // Workers still provisioning are covered by the ready timeout.
        let settled = fleet
            .live_of_version(&target)
            .filter(|w| w.lifecycle != WorkerLifecycle::Provisioning)
            .count() as u32;
        let healthy = if settled == 0 {
            100
        } else {
            percent(green_ready, settled)
        };
        if healthy < cfg.min_healthy_percent {
            rollout.roll_back(now, &format!("green cohort health dropped to {healthy}%"));
            return None;
        }
        if now.saturating_sub(rollout.progress.since) < cfg.drain_window_secs {
            return None;
        }
        let terminate: Vec<WorkerId> = live_members(rollout, fleet, &baseline)
            .into_iter()
            .map(|w| w.id.clone())
            .collect();
        rollout.complete(now);
        return Some(RolloutProposal {
            terminate,
            ..Default::default()
        });
    }

    let size = fleet.desired_capacity;
    if green_live < size {
        debug!(rollout = %rollout.id, have = green_live, want = size, "provisioning green cohort");
        return Some(RolloutProposal {
            create: vec![target; (size - green_live) as usize],
            ..Default::default()
        });
    }
    if green_ready < green_live {
        return None;
    }

    let drain: Vec<WorkerId> = live_members(rollout, fleet, &baseline)
        .into_iter()
        .filter(|w| w.is_live())
        .map(|w| w.id.clone())
        .collect();
    info!(
        rollout = %rollout.id,
        green = green_ready,
        draining = drain.len(),
        "flipping traffic to green cohort"
    );
    let weights = rollout.split(100);
    rollout.enter(RolloutPhase::Baking, now);
    Some(RolloutProposal {
        drain,
        weights: Some(weights),
        ..Default::default()
    })
}

// ── Canary ────────────────────────────────────────────────────────

fn step_canary(
    now: Timestamp,
    cfg: &CanaryConfig,
    rollout: &mut Rollout,
    fleet: &FleetState,
    metrics: &dyn MetricSource,
) -> Option<RolloutProposal> {
    if rollout.phase == RolloutPhase::Baking {
        if let Some(reason) = breach(cfg, rollout, metrics) {
            rollout.roll_back(now, &reason);
            return None;
        }
        if now.saturating_sub(rollout.progress.since) < cfg.bake_secs {
            return None;
        }
        rollout.progress.step += 1;
        rollout.enter(RolloutPhase::InProgress, now);
        debug!(
            rollout = %rollout.id,
            step = rollout.progress.step,
            "canary bake clean, advancing"
        );
    }

    let mut proposal = RolloutProposal::default();
    let mut base = fleet.desired_capacity.saturating_sub(rollout.progress.bonus);
    if !rollout.progress.bonus_claimed {
        let headroom = fleet.max_capacity.saturating_sub(fleet.desired_capacity);
        let bonus = cfg.canary_instances.min(headroom);
        rollout.progress.bonus = bonus;
        rollout.progress.bonus_claimed = true;
        proposal.capacity_delta = bonus as i32;
        base = fleet.desired_capacity;
        debug!(rollout = %rollout.id, bonus, headroom, "claiming canary capacity");
    }

    // Canary and baseline share `total`: the canary cohort grows by giving
    // up baseline workers, never by creating past desired capacity.
    let total = base + rollout.progress.bonus;
    let baseline = rollout.baseline_version.clone();
    let floor = u32::from(rollout.cohorts.weight_of(&baseline) > 0);
    let weight = cfg.steps.get(rollout.progress.step).copied().unwrap_or(100);
    let wanted = if weight >= 100 {
        base
    } else {
        cfg.canary_instances
            .max((base * u32::from(weight)).div_ceil(100))
    };
    let needed = wanted.min(total.saturating_sub(floor));
    if needed == 0 {
        // Nothing was granted yet if the claim happened in this step.
        if proposal.capacity_delta > 0 {
            rollout.progress.bonus = 0;
        }
        rollout.fail(now, "no capacity for a canary worker");
        return None;
    }

    let target = rollout.target_version.clone();
    let live = fleet.live_of_version(&target).count() as u32;
    let ready = fleet.ready_of_version(&target);
    let baseline_live = fleet.live_of_version(&baseline).count() as u32;

    let excess = (baseline_live + live.max(needed))
        .saturating_sub(total)
        .min(baseline_live.saturating_sub(floor));
    if excess > 0 {
        proposal.terminate = fleet
            .termination_candidates(|w| w.version != baseline)
            .into_iter()
            .take(excess as usize)
            .map(|w| w.id.clone())
            .collect();
    }
    let room = total.saturating_sub(baseline_live - excess + live);
    let create = needed.saturating_sub(live).min(room);
    if create > 0 {
        proposal.create = vec![target.clone(); create as usize];
    }
    if excess > 0 || create > 0 {
        debug!(rollout = %rollout.id, weight, needed, excess, create, "resizing canary cohort");
        return Some(proposal);
    }
    if ready < needed {
        return Some(proposal);
    }

    proposal.weights = Some(rollout.split(weight));
    if weight >= 100 {
        proposal.terminate = live_members(rollout, fleet, &baseline)
            .into_iter()
            .map(|w| w.id.clone())
            .collect();
        // Without bonus capacity the last baseline worker held a slot.
        proposal.create = vec![target; base.saturating_sub(live) as usize];
        proposal.capacity_delta -= release_bonus(rollout, fleet) as i32;
        rollout.complete(now);
    } else {
        info!(rollout = %rollout.id, weight, canaries = ready, "canary step applied, baking");
        rollout.enter(RolloutPhase::Baking, now);
    }
    Some(proposal)
}

/// First threshold exceeded by any cohort sample taken during this bake.
fn breach(cfg: &CanaryConfig, rollout: &Rollout, metrics: &dyn MetricSource) -> Option<String> {
    let scope = MetricScope::Cohort(rollout.target_version.clone());
    let weight = rollout.cohorts.weight_of(&rollout.target_version);
    cfg.thresholds.iter().find_map(|t| {
        let worst = metrics
            .window(&t.metric, &scope, rollout.progress.since)
            .into_iter()
            .filter(|s| s.value > t.max)
            .max_by(|a, b| a.value.total_cmp(&b.value))?;
        Some(format!(
            "canary {} {:.2} exceeded {:.2} at {weight}% traffic (t={})",
            t.metric, worst.value, t.max, worst.timestamp
        ))
    })
}
