//! FleetState: the authoritative record of workers and capacity.
//!
//! Only the reconciler writes a `FleetState`. Planning happens on a clone,
//! which is validated with [`crate::check_invariants`] before any driver
//! call is issued.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};
use crate::types::*;

/// Capacity and membership record of one fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetState {
    /// Workers in creation order.
    pub workers: Vec<Worker>,
    pub desired_capacity: u32,
    pub min_capacity: u32,
    pub max_capacity: u32,
    /// The rollout currently owning cohort weights, if any.
    pub active_rollout: Option<RolloutId>,
    /// When the autoscaler last changed `desired_capacity`.
    pub last_scale_action: Option<Timestamp>,
    /// Version new baseline workers are created at.
    pub stable_version: Version,
    /// Cohort weights last acknowledged by the driver.
    #[serde(default)]
    pub traffic: BTreeMap<Version, u8>,
}

impl FleetState {
    /// Create an empty fleet. Fails if `min <= desired <= max` does not hold.
    pub fn new(stable_version: &str, min: u32, max: u32, desired: u32) -> FleetResult<Self> {
        if stable_version.is_empty() {
            return Err(FleetError::Config("stable version must not be empty".to_string()));
        }
        validate_bounds(min, max)?;
        if desired < min || desired > max {
            return Err(FleetError::Config(format!(
                "desired capacity {desired} outside [{min}, {max}]"
            )));
        }
        Ok(Self {
            workers: Vec::new(),
            desired_capacity: desired,
            min_capacity: min,
            max_capacity: max,
            active_rollout: None,
            last_scale_action: None,
            stable_version: stable_version.to_string(),
            traffic: BTreeMap::from([(stable_version.to_string(), 100)]),
        })
    }

    pub fn worker(&self, id: &str) -> Option<&Worker> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub fn worker_mut(&mut self, id: &str) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.id == id)
    }

    /// Append a worker, preserving creation order.
    pub fn push_worker(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    pub fn live_workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter().filter(|w| w.is_live())
    }

    pub fn live_count(&self) -> u32 {
        self.live_workers().count() as u32
    }

    pub fn live_of_version<'a>(&'a self, version: &'a str) -> impl Iterator<Item = &'a Worker> {
        self.live_workers().filter(move |w| w.version == version)
    }

    pub fn ready_of_version(&self, version: &str) -> u32 {
        self.live_of_version(version).filter(|w| w.is_ready()).count() as u32
    }

    /// True when traffic is routed entirely to the stable version.
    pub fn traffic_settled(&self) -> bool {
        self.traffic.get(&self.stable_version) == Some(&100)
    }

    /// Drop terminated workers from the record. Returns how many were removed.
    pub fn prune_terminated(&mut self) -> usize {
        let before = self.workers.len();
        self.workers
            .retain(|w| w.lifecycle != WorkerLifecycle::Terminated);
        before - self.workers.len()
    }

    /// Clamp a capacity to `[min, max]`.
    pub fn clamp(&self, capacity: i64) -> u32 {
        capacity.clamp(i64::from(self.min_capacity), i64::from(self.max_capacity)) as u32
    }

    /// Replace the capacity bounds, pulling `desired_capacity` inside them.
    pub fn set_bounds(&mut self, min: u32, max: u32) -> FleetResult<()> {
        validate_bounds(min, max)?;
        self.min_capacity = min;
        self.max_capacity = max;
        self.desired_capacity = self.desired_capacity.clamp(min, max);
        Ok(())
    }

    /// Live workers ordered by termination preference.
    ///
    /// Unhealthy workers go first, then workers not yet ready, then the
    /// rest in creation order. Workers for which `exclude` returns true are
    /// never candidates.
    pub fn termination_candidates<F>(&self, exclude: F) -> Vec<&Worker>
    where
        F: Fn(&Worker) -> bool,
    {
        let mut candidates: Vec<(u8, usize, &Worker)> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.is_live() && !exclude(w))
            .map(|(idx, w)| (termination_rank(w), idx, w))
            .collect();
        candidates.sort_by_key(|(rank, idx, _)| (*rank, *idx));
        candidates.into_iter().map(|(_, _, w)| w).collect()
    }
}

fn termination_rank(worker: &Worker) -> u8 {
    if worker.health == HealthStatus::Unhealthy {
        0
    } else if worker.lifecycle == WorkerLifecycle::Provisioning {
        1
    } else {
        2
    }
}

fn validate_bounds(min: u32, max: u32) -> FleetResult<()> {
    if min > max {
        return Err(FleetError::Config(format!(
            "min capacity {min} exceeds max capacity {max}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(id: &str, version: &str, created_at: u64) -> Worker {
        let mut w = Worker::provisioning(id, version, created_at);
        w.lifecycle = WorkerLifecycle::Ready;
        w.health = HealthStatus::Healthy;
        w
    }

    #[test]
    fn new_rejects_desired_outside_bounds() {
        assert!(matches!(
            FleetState::new("v1", 2, 4, 5),
            Err(FleetError::Config(_))
        ));
        assert!(matches!(
            FleetState::new("v1", 5, 4, 4),
            Err(FleetError::Config(_))
        ));
        assert!(FleetState::new("v1", 0, 4, 0).is_ok());
    }

    #[test]
    fn set_bounds_clamps_desired() {
        let mut state = FleetState::new("v1", 1, 10, 8).unwrap();
        state.set_bounds(1, 5).unwrap();
        assert_eq!(state.desired_capacity, 5);

        state.set_bounds(6, 9).unwrap();
        assert_eq!(state.desired_capacity, 6);
    }

    #[test]
    fn termination_prefers_unhealthy_then_provisioning_then_oldest() {
        let mut state = FleetState::new("v1", 0, 10, 4).unwrap();
        state.push_worker(ready("w-1", "v1", 10));
        state.push_worker(ready("w-2", "v1", 20));
        state.push_worker(Worker::provisioning("w-3", "v1", 30));
        let mut sick = ready("w-4", "v1", 40);
        sick.health = HealthStatus::Unhealthy;
        state.push_worker(sick);

        let order: Vec<&str> = state
            .termination_candidates(|_| false)
            .iter()
            .map(|w| w.id.as_str())
            .collect();
        assert_eq!(order, vec!["w-4", "w-3", "w-1", "w-2"]);
    }

    #[test]
    fn termination_candidates_honor_exclusion() {
        let mut state = FleetState::new("v1", 0, 10, 2).unwrap();
        state.push_worker(ready("w-1", "v1", 10));
        state.push_worker(ready("w-2", "v2", 20));

        let order: Vec<&str> = state
            .termination_candidates(|w| w.version == "v2")
            .iter()
            .map(|w| w.id.as_str())
            .collect();
        assert_eq!(order, vec!["w-1"]);
    }

    #[test]
    fn prune_drops_terminated_only() {
        let mut state = FleetState::new("v1", 0, 10, 2).unwrap();
        state.push_worker(ready("w-1", "v1", 10));
        let mut gone = ready("w-2", "v1", 20);
        gone.lifecycle = WorkerLifecycle::Terminated;
        state.push_worker(gone);

        assert_eq!(state.prune_terminated(), 1);
        assert_eq!(state.workers.len(), 1);
        assert_eq!(state.live_count(), 1);
    }

    #[test]
    fn clamp_respects_bounds() {
        let state = FleetState::new("v1", 1, 6, 2).unwrap();
        assert_eq!(state.clamp(-3), 1);
        assert_eq!(state.clamp(4), 4);
        assert_eq!(state.clamp(40), 6);
    }
}
