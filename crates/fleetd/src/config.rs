//! fleet.toml configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use fleetgrid_health::HealthConfig;
use fleetgrid_reconcile::ReconcilerConfig;
use fleetgrid_rollout::RolloutSpec;
use fleetgrid_state::{FleetState, ScalingPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub fleet: FleetSection,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Autoscaling is off without a policy.
    pub scaling: Option<ScalingPolicy>,
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Rollout submitted once the controller is running.
    pub rollout: Option<RolloutSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSection {
    pub stable_version: String,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub desired_capacity: u32,
    /// Directory for the checkpoint database. State is kept in memory when unset.
    pub data_dir: Option<PathBuf>,
}

/// Synthetic load fed into the metric registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Fleet-wide metric the load curve is recorded under.
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_base")]
    pub base: f64,
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    #[serde(default = "default_period")]
    pub period_secs: u64,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Error rate reported for every cohort other than the stable one.
    #[serde(default)]
    pub candidate_error_rate: f64,
}

fn default_metric() -> String {
    "cpu".to_string()
}

fn default_base() -> f64 {
    60.0
}

fn default_amplitude() -> f64 {
    25.0
}

fn default_period() -> u64 {
    600
}

fn default_interval() -> u64 {
    5
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            base: default_base(),
            amplitude: default_amplitude(),
            period_secs: default_period(),
            interval_secs: default_interval(),
            candidate_error_rate: 0.0,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Everything the controller would reject later, checked up front.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.initial_state()?;
        if let Some(policy) = &self.scaling {
            policy.validate()?;
        }
        if let Some(rollout) = &self.rollout {
            rollout.validate(&self.fleet.stable_version)?;
        }
        anyhow::ensure!(self.simulation.period_secs > 0, "simulation period must be positive");
        Ok(())
    }

    pub fn initial_state(&self) -> anyhow::Result<FleetState> {
        let f = &self.fleet;
        Ok(FleetState::new(
            &f.stable_version,
            f.min_capacity,
            f.max_capacity,
            f.desired_capacity,
        )?)
    }
}
