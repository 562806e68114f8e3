//! Invariant checks run on every reconciliation pass.

use std::collections::BTreeSet;

use crate::cohort::CohortSet;
use crate::error::{FleetError, FleetResult};
use crate::fleet::FleetState;
use crate::types::WorkerLifecycle;

/// Validate a (planned) fleet state and the active rollout's cohorts.
///
/// `cohorts` must be `Some` exactly when `state.active_rollout` is set.
/// Any violation is reported as [`FleetError::Conflict`].
pub fn check_invariants(state: &FleetState, cohorts: Option<&CohortSet>) -> FleetResult<()> {
    if state.min_capacity > state.max_capacity
        || state.desired_capacity < state.min_capacity
        || state.desired_capacity > state.max_capacity
    {
        return Err(FleetError::Conflict(format!(
            "capacity bounds violated: min={} desired={} max={}",
            state.min_capacity, state.desired_capacity, state.max_capacity
        )));
    }

    let cohorts = match (&state.active_rollout, cohorts) {
        (None, None) => return Ok(()),
        (Some(id), None) => {
            return Err(FleetError::Conflict(format!(
                "rollout {id} is active but has no cohort table"
            )));
        }
        (None, Some(_)) => {
            return Err(FleetError::Conflict(
                "cohort table present without an active rollout".to_string(),
            ));
        }
        (Some(_), Some(c)) => c,
    };

    let total = cohorts.total_weight();
    if total != 100 {
        return Err(FleetError::Conflict(format!(
            "cohort weights sum to {total}, expected 100"
        )));
    }

    let mut seen = BTreeSet::new();
    for (version, cohort) in cohorts.iter() {
        if cohort.weight > 100 {
            return Err(FleetError::Conflict(format!(
                "cohort {version} weight {} out of range",
                cohort.weight
            )));
        }
        for id in &cohort.workers {
            if !seen.insert(id.as_str()) {
                return Err(FleetError::Conflict(format!(
                    "worker {id} belongs to more than one cohort"
                )));
            }
            let worker = state.worker(id).ok_or_else(|| {
                FleetError::Conflict(format!("cohort {version} references unknown worker {id}"))
            })?;
            if worker.lifecycle == WorkerLifecycle::Terminated {
                return Err(FleetError::Conflict(format!(
                    "cohort {version} references terminated worker {id}"
                )));
            }
            if &worker.version != version {
                return Err(FleetError::Conflict(format!(
                    "worker {id} runs {} but sits in cohort {version}",
                    worker.version
                )));
            }
        }
    }

    Ok(())
}
