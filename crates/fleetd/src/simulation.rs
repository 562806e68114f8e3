//! Synthetic metric feed for running the controller without a real fleet.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetgrid_metrics::{MetricScope, MetricsRegistry};
use fleetgrid_reconcile::{ControllerHandle, epoch_secs};
use fleetgrid_state::Timestamp;

use crate::config::SimulationConfig;

/// Load at `now` on a sine curve around `base`.
pub fn load_at(cfg: &SimulationConfig, now: Timestamp) -> f64 {
    let period = cfg.period_secs.max(1);
    let phase = (now % period) as f64 / period as f64;
    (cfg.base + cfg.amplitude * (phase * TAU).sin()).max(0.0)
}

/// Records load and per-cohort error rates, nudging the controller after
/// every round.
pub struct LoadFeeder {
    config: SimulationConfig,
    metrics: Arc<MetricsRegistry>,
    handle: ControllerHandle,
}

impl LoadFeeder {
    pub fn new(config: SimulationConfig, metrics: Arc<MetricsRegistry>, handle: ControllerHandle) -> Self {
        Self {
            config,
            metrics,
            handle,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        info!(
            metric = %self.config.metric,
            interval_secs = interval.as_secs(),
            "load feeder started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.record(epoch_secs()).await;
                }
                _ = shutdown.changed() => {
                    info!("load feeder shutting down");
                    return;
                }
            }
        }
    }

    async fn record(&self, now: Timestamp) {
        let load = load_at(&self.config, now);
        self.metrics
            .record(&self.config.metric, MetricScope::Fleet, load, now);

        match self.handle.fleet_status().await {
            Ok(status) => {
                for version in status.traffic.keys() {
                    let rate = if *version == status.stable_version {
                        0.0
                    } else {
                        self.config.candidate_error_rate
                    };
                    self.metrics
                        .record("error_rate", MetricScope::Cohort(version.clone()), rate, now);
                }
            }
            Err(e) => warn!(error = %e, "fleet status unavailable"),
        }

        debug!(load, "load sample recorded");
        self.handle.notify();
    }
}
