//! The metric source interface.

use serde::{Deserialize, Serialize};

use fleetgrid_state::{Timestamp, Version, WorkerId};

/// What a sample describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum MetricScope {
    /// Aggregate over the whole fleet.
    Fleet,
    /// Restricted to the workers of one version.
    Cohort(Version),
    /// A single worker.
    Worker(WorkerId),
}

impl std::fmt::Display for MetricScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fleet => f.write_str("fleet"),
            Self::Cohort(v) => write!(f, "cohort:{v}"),
            Self::Worker(w) => write!(f, "worker:{w}"),
        }
    }
}

/// A point-in-time observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    pub timestamp: Timestamp,
}

/// Supplies samples of a named metric for a scope.
pub trait MetricSource: Send + Sync {
    /// The newest sample.
    fn sample(&self, metric: &str, scope: &MetricScope) -> Option<MetricSample>;

    /// Every retained sample taken at or after `since`, oldest first.
    /// Sources without history only report their newest sample.
    fn window(&self, metric: &str, scope: &MetricScope, since: Timestamp) -> Vec<MetricSample> {
        self.sample(metric, scope)
            .filter(|s| s.timestamp >= since)
            .into_iter()
            .collect()
    }
}
