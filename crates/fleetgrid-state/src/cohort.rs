//! Cohort tables: per-version worker membership and traffic weight.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{Version, WorkerId};

/// The workers running one version, and the share of traffic they carry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cohort {
    pub workers: BTreeSet<WorkerId>,
    /// Traffic weight in [0, 100].
    pub weight: u8,
}

/// Version → cohort mapping of a rollout.
///
/// Weights across all cohorts must sum to exactly 100; that and membership
/// exclusivity are enforced by [`crate::check_invariants`], not here, so a
/// planned state can be built up step by step before it is validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CohortSet {
    cohorts: BTreeMap<Version, Cohort>,
}

impl CohortSet {
    /// A single cohort carrying all traffic.
    pub fn single<I>(version: &str, workers: I) -> Self
    where
        I: IntoIterator<Item = WorkerId>,
    {
        let mut set = Self::default();
        let cohort = set.ensure(version);
        cohort.workers.extend(workers);
        cohort.weight = 100;
        set
    }

    pub fn get(&self, version: &str) -> Option<&Cohort> {
        self.cohorts.get(version)
    }

    /// Get the cohort for a version, creating it at weight 0.
    pub fn ensure(&mut self, version: &str) -> &mut Cohort {
        self.cohorts.entry(version.to_string()).or_default()
    }

    /// Add a worker to the cohort of `version`.
    pub fn admit(&mut self, version: &str, worker: &str) {
        self.ensure(version).workers.insert(worker.to_string());
    }

    /// Remove a worker from every cohort. Returns true if it was a member.
    pub fn evict(&mut self, worker: &str) -> bool {
        let mut removed = false;
        for cohort in self.cohorts.values_mut() {
            removed |= cohort.workers.remove(worker);
        }
        removed
    }

    /// The version whose cohort contains `worker`.
    pub fn cohort_of(&self, worker: &str) -> Option<&str> {
        self.cohorts
            .iter()
            .find(|(_, c)| c.workers.contains(worker))
            .map(|(v, _)| v.as_str())
    }

    pub fn contains(&self, worker: &str) -> bool {
        self.cohorts.values().any(|c| c.workers.contains(worker))
    }

    pub fn weight_of(&self, version: &str) -> u8 {
        self.cohorts.get(version).map(|c| c.weight).unwrap_or(0)
    }

    /// Current weights per version.
    pub fn weights(&self) -> BTreeMap<Version, u8> {
        self.cohorts
            .iter()
            .map(|(v, c)| (v.clone(), c.weight))
            .collect()
    }

    /// Replace the weights. Versions missing from `weights` drop to 0.
    pub fn set_weights(&mut self, weights: &BTreeMap<Version, u8>) {
        for cohort in self.cohorts.values_mut() {
            cohort.weight = 0;
        }
        for (version, weight) in weights {
            self.ensure(version).weight = *weight;
        }
    }

    pub fn total_weight(&self) -> u32 {
        self.cohorts.values().map(|c| u32::from(c.weight)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Version, &Cohort)> {
        self.cohorts.iter()
    }

    pub fn members(&self, version: &str) -> impl Iterator<Item = &WorkerId> {
        self.cohorts
            .get(version)
            .into_iter()
            .flat_map(|c| c.workers.iter())
    }

    pub fn size_of(&self, version: &str) -> usize {
        self.cohorts.get(version).map(|c| c.workers.len()).unwrap_or(0)
    }
}
