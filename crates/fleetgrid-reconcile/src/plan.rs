//! Planning: the candidate next state of one tick.
//!
//! A [`Plan`] starts as a copy of the fleet and the active rollout. The
//! scaling decision is applied first, then the rollout proposal, then
//! drift repair; each step records the driver [`Action`]s it needs. The
//! reconciler validates the planned state before executing anything.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use fleetgrid_autoscale::ScalingDecision;
use fleetgrid_rollout::{Rollout, RolloutProposal};
use fleetgrid_state::{
    FleetResult, FleetState, Timestamp, Version, Worker, WorkerId, WorkerLifecycle,
    check_invariants,
};

/// Which decision an action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Scaling,
    Rollout,
    Repair,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scaling => f.write_str("scaling"),
            Self::Rollout => f.write_str("rollout"),
            Self::Repair => f.write_str("repair"),
        }
    }
}

/// One step of an executed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Create a worker; `slot` is its placeholder id in the planned state.
    Create {
        version: Version,
        slot: WorkerId,
        origin: Origin,
    },
    Terminate { worker: WorkerId, origin: Origin },
    SetWeights {
        weights: BTreeMap<Version, u8>,
        origin: Origin,
    },
    /// Take a worker out of rotation without a driver call.
    Drain { worker: WorkerId },
    /// Put a draining worker back into rotation without a driver call.
    Reinstate { worker: WorkerId },
}

impl Action {
    pub fn origin(&self) -> Origin {
        match self {
            Self::Create { origin, .. }
            | Self::Terminate { origin, .. }
            | Self::SetWeights { origin, .. } => *origin,
            Self::Drain { .. } | Self::Reinstate { .. } => Origin::Rollout,
        }
    }
}

const SLOT_PREFIX: &str = "planned-";

/// Candidate next state and the actions that would produce it.
#[derive(Debug, Clone)]
pub struct Plan {
    pub state: FleetState,
    pub rollout: Option<Rollout>,
    pub actions: Vec<Action>,
    now: Timestamp,
    next_slot: usize,
}

impl Plan {
    pub fn new(state: &FleetState, rollout: Option<&Rollout>, now: Timestamp) -> Self {
        Self {
            state: state.clone(),
            rollout: rollout.cloned(),
            actions: Vec::new(),
            now,
            next_slot: 0,
        }
    }

    pub fn is_placeholder(id: &str) -> bool {
        id.starts_with(SLOT_PREFIX)
    }

    /// Apply a capacity decision. Without a rollout, drift repair turns the
    /// new desired capacity into creates and terminates; during a rollout,
    /// added capacity is created at the rollout's fill version and scale-in
    /// only picks workers outside its cohorts.
    pub fn apply_scaling(&mut self, decision: &ScalingDecision) {
        if decision.is_noop() {
            return;
        }
        let desired = i64::from(self.state.desired_capacity) + i64::from(decision.delta);
        self.state.desired_capacity = desired.max(0) as u32;
        self.state.last_scale_action = Some(self.now);

        let Some(rollout) = &self.rollout else {
            return;
        };
        if decision.delta > 0 {
            let version = rollout.fill_version().to_string();
            for _ in 0..decision.delta {
                self.create(&version, Origin::Scaling);
            }
        } else {
            let victims: Vec<WorkerId> = self
                .state
                .termination_candidates(|w| rollout.cohorts.contains(&w.id))
                .into_iter()
                .take(decision.delta.unsigned_abs() as usize)
                .map(|w| w.id.clone())
                .collect();
            for id in victims {
                self.terminate(&id, Origin::Scaling);
            }
        }
    }

    /// Apply a rollout proposal against the (already scaled) plan.
    pub fn apply_proposal(&mut self, proposal: RolloutProposal) {
        let desired = i64::from(self.state.desired_capacity) + i64::from(proposal.capacity_delta);
        self.state.desired_capacity = desired.max(0) as u32;

        for id in proposal.reinstate {
            if let Some(w) = self.state.worker_mut(&id) {
                w.lifecycle = WorkerLifecycle::Ready;
                self.actions.push(Action::Reinstate { worker: id });
            }
        }
        if let Some(weights) = proposal.weights {
            self.set_weights(weights, Origin::Rollout);
        }
        // Terminations go first so creates never overshoot desired capacity.
        for id in proposal.terminate {
            self.terminate(&id, Origin::Rollout);
        }
        for version in proposal.create {
            self.create(&version, Origin::Rollout);
        }
        for id in proposal.drain {
            if let Some(w) = self.state.worker_mut(&id)
                && w.is_live()
            {
                w.lifecycle = WorkerLifecycle::Draining;
                self.actions.push(Action::Drain { worker: id });
            }
        }
    }

    /// Converge a fleet with no active rollout: stray versions and draining
    /// leftovers are terminated, the live count is brought to desired, and
    /// traffic is pointed at the stable version.
    pub fn repair(&mut self) {
        if self.rollout.is_some() {
            return;
        }
        let stable = self.state.stable_version.clone();

        let strays: Vec<WorkerId> = self
            .state
            .workers
            .iter()
            .filter(|w| {
                (w.is_live() && w.version != stable) || w.lifecycle == WorkerLifecycle::Draining
            })
            .map(|w| w.id.clone())
            .collect();
        for id in strays {
            self.terminate(&id, Origin::Repair);
        }

        let live = self.state.live_count();
        let desired = self.state.desired_capacity;
        if live < desired {
            for _ in live..desired {
                self.create(&stable, Origin::Repair);
            }
        } else if live > desired {
            let excess: Vec<WorkerId> = self
                .state
                .termination_candidates(|_| false)
                .into_iter()
                .take((live - desired) as usize)
                .map(|w| w.id.clone())
                .collect();
            for id in excess {
                self.terminate(&id, Origin::Repair);
            }
        }

        if !self.state.traffic_settled() {
            let weights = BTreeMap::from([(stable, 100)]);
            self.actions.push(Action::SetWeights {
                weights,
                origin: Origin::Repair,
            });
        }
    }

    /// Check the planned state against every fleet invariant.
    pub fn validate(&self) -> FleetResult<()> {
        check_invariants(&self.state, self.rollout.as_ref().map(|r| &r.cohorts))
    }

    fn create(&mut self, version: &str, origin: Origin) {
        self.next_slot += 1;
        let slot = format!("{SLOT_PREFIX}{}", self.next_slot);
        self.state
            .push_worker(Worker::provisioning(&slot, version, self.now));
        if let Some(rollout) = &mut self.rollout {
            rollout.cohorts.admit(version, &slot);
        }
        self.actions.push(Action::Create {
            version: version.to_string(),
            slot,
            origin,
        });
    }

    fn terminate(&mut self, id: &str, origin: Origin) {
        let Some(worker) = self.state.worker_mut(id) else {
            return;
        };
        if worker.lifecycle == WorkerLifecycle::Terminated {
            return;
        }
        worker.lifecycle = WorkerLifecycle::Terminated;
        if let Some(rollout) = &mut self.rollout {
            rollout.cohorts.evict(id);
        }
        self.actions.push(Action::Terminate {
            worker: id.to_string(),
            origin,
        });
    }

    fn set_weights(&mut self, weights: BTreeMap<Version, u8>, origin: Origin) {
        if let Some(rollout) = &mut self.rollout {
            rollout.cohorts.set_weights(&weights);
        }
        self.actions.push(Action::SetWeights { weights, origin });
    }
}
