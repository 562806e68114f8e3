//! In-memory metric registry.
//!
//! Keeps a bounded history of samples per (metric, scope). Writers are the
//! pollers; the reconciliation loop only reads. Lock hold times are a
//! single map lookup, so a `std::sync::RwLock` is enough.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use tracing::trace;

use fleetgrid_state::Timestamp;

use crate::source::{MetricSample, MetricScope, MetricSource};

/// Default number of samples retained per series.
pub const DEFAULT_HISTORY: usize = 64;

type SeriesKey = (String, MetricScope);

/// Thread-safe store of recent samples.
#[derive(Debug)]
pub struct MetricsRegistry {
    series: RwLock<HashMap<SeriesKey, VecDeque<MetricSample>>>,
    history: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl MetricsRegistry {
    /// Create a registry keeping at most `history` samples per series.
    pub fn new(history: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            history: history.max(1),
        }
    }

    /// Record a sample. Samples older than the newest one are still kept in
    /// arrival order; `sample()` always returns the newest timestamp.
    pub fn record(&self, metric: &str, scope: MetricScope, value: f64, timestamp: Timestamp) {
        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        let ring = series.entry((metric.to_string(), scope)).or_default();
        if ring.len() == self.history {
            ring.pop_front();
        }
        ring.push_back(MetricSample { value, timestamp });
        trace!(%metric, value, timestamp, "metric sample recorded");
    }
}

impl MetricSource for MetricsRegistry {
    fn sample(&self, metric: &str, scope: &MetricScope) -> Option<MetricSample> {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        series
            .get(&(metric.to_string(), scope.clone()))?
            .iter()
            .max_by_key(|s| s.timestamp)
            .copied()
    }

    fn window(&self, metric: &str, scope: &MetricScope, since: Timestamp) -> Vec<MetricSample> {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        let mut samples: Vec<MetricSample> = series
            .get(&(metric.to_string(), scope.clone()))
            .map(|ring| {
                ring.iter()
                    .filter(|s| s.timestamp >= since)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        samples.sort_by_key(|s| s.timestamp);
        samples
    }
}
