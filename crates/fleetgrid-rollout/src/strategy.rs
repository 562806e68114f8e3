//! Rollout strategies: rolling update, blue-green, canary.

use serde::{Deserialize, Serialize};

use fleetgrid_state::{FleetError, FleetResult};

/// How to roll a new version into the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Replace workers one at a time. Default.
    Rolling(RollingConfig),
    /// Provision a full parallel cohort, then flip all traffic at once.
    BlueGreen(BlueGreenConfig),
    /// Shift traffic to the new version in weighted steps.
    Canary(CanaryConfig),
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self::Rolling(RollingConfig::default())
    }
}

impl RolloutStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rolling(_) => "rolling",
            Self::BlueGreen(_) => "blue_green",
            Self::Canary(_) => "canary",
        }
    }

    /// Seconds a new worker may stay unready before the rollout fails.
    pub fn ready_timeout_secs(&self) -> u64 {
        match self {
            Self::Rolling(cfg) => cfg.ready_timeout_secs,
            Self::BlueGreen(cfg) => cfg.ready_timeout_secs,
            Self::Canary(cfg) => cfg.ready_timeout_secs,
        }
    }

    pub fn validate(&self) -> FleetResult<()> {
        match self {
            Self::Rolling(cfg) => cfg.validate(),
            Self::BlueGreen(cfg) => cfg.validate(),
            Self::Canary(cfg) => cfg.validate(),
        }
    }
}

fn default_ready_timeout() -> u64 {
    300
}

// ── Rolling ───────────────────────────────────────────────────────

/// Configuration for rolling updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingConfig {
    /// Extra workers allowed above desired capacity while replacing.
    #[serde(default = "default_max_surge")]
    pub max_surge: u32,
    /// Ready workers allowed below desired capacity while replacing.
    #[serde(default)]
    pub max_unavailable: u32,
    /// Seconds to wait for a new worker to become ready.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Seconds to bake after the last replacement. Zero completes at once.
    #[serde(default)]
    pub bake_secs: u64,
}

fn default_max_surge() -> u32 {
    1
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            max_surge: default_max_surge(),
            max_unavailable: 0,
            ready_timeout_secs: default_ready_timeout(),
            bake_secs: 0,
        }
    }
}

impl RollingConfig {
    fn validate(&self) -> FleetResult<()> {
        if self.max_surge + self.max_unavailable == 0 {
            return Err(FleetError::Config(
                "rolling update needs max_surge + max_unavailable >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Blue-green ────────────────────────────────────────────────────

/// Configuration for blue-green switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueGreenConfig {
    /// Seconds to wait for the green cohort to become ready.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Seconds the old cohort keeps draining after the flip.
    #[serde(default = "default_drain_window")]
    pub drain_window_secs: u64,
    /// Percentage of green workers that must stay ready during the drain
    /// window. Dropping below re-flips traffic to the old cohort.
    #[serde(default = "default_min_healthy_percent")]
    pub min_healthy_percent: u8,
}

fn default_drain_window() -> u64 {
    300
}

fn default_min_healthy_percent() -> u8 {
    80
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout(),
            drain_window_secs: default_drain_window(),
            min_healthy_percent: default_min_healthy_percent(),
        }
    }
}

impl BlueGreenConfig {
    fn validate(&self) -> FleetResult<()> {
        if self.min_healthy_percent > 100 {
            return Err(FleetError::Config(format!(
                "min_healthy_percent {} exceeds 100",
                self.min_healthy_percent
            )));
        }
        Ok(())
    }
}

// ── Canary ────────────────────────────────────────────────────────

/// Upper bound on a cohort-scoped metric during a canary bake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub metric: String,
    pub max: f64,
}

impl MetricThreshold {
    pub fn new(metric: &str, max: f64) -> Self {
        Self {
            metric: metric.to_string(),
            max,
        }
    }
}

/// Configuration for canary deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Traffic percentages to step through. Must ascend and end at 100.
    #[serde(default = "default_steps")]
    pub steps: Vec<u8>,
    /// Minimum canary cohort size, claimed as bonus capacity.
    #[serde(default = "default_canary_instances")]
    pub canary_instances: u32,
    /// Seconds to observe each step before advancing.
    #[serde(default = "default_bake")]
    pub bake_secs: u64,
    /// Seconds to wait for canary workers to become ready.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Roll back if any of these is exceeded during a bake.
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<MetricThreshold>,
}

fn default_steps() -> Vec<u8> {
    vec![10, 50, 100]
}

fn default_canary_instances() -> u32 {
    1
}

fn default_bake() -> u64 {
    300
}

fn default_thresholds() -> Vec<MetricThreshold> {
    vec![
        MetricThreshold::new("error_rate", 5.0),
        MetricThreshold::new("latency_p99_ms", 1000.0),
    ]
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            canary_instances: default_canary_instances(),
            bake_secs: default_bake(),
            ready_timeout_secs: default_ready_timeout(),
            thresholds: default_thresholds(),
        }
    }
}

impl CanaryConfig {
    fn validate(&self) -> FleetResult<()> {
        if self.steps.last() != Some(&100) {
            return Err(FleetError::Config(
                "canary steps must end at 100".to_string(),
            ));
        }
        if self.steps.iter().any(|s| *s == 0 || *s > 100) {
            return Err(FleetError::Config(
                "canary steps must lie in 1..=100".to_string(),
            ));
        }
        if self.steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FleetError::Config(
                "canary steps must be strictly ascending".to_string(),
            ));
        }
        if self.canary_instances == 0 {
            return Err(FleetError::Config(
                "canary_instances must be at least 1".to_string(),
            ));
        }
        if let Some(t) = self.thresholds.iter().find(|t| t.metric.is_empty()) {
            return Err(FleetError::Config(format!(
                "canary threshold with max {} names no metric",
                t.max
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rolling() {
        match RolloutStrategy::default() {
            RolloutStrategy::Rolling(cfg) => {
                assert_eq!(cfg.max_surge, 1);
                assert_eq!(cfg.max_unavailable, 0);
                assert_eq!(cfg.ready_timeout_secs, 300);
            }
            other => panic!("expected Rolling, got {other:?}"),
        }
    }

    #[test]
    fn canary_defaults() {
        let cfg = CanaryConfig::default();
        assert_eq!(cfg.steps, vec![10, 50, 100]);
        assert_eq!(cfg.thresholds.len(), 2);
        assert!(RolloutStrategy::Canary(cfg).validate().is_ok());
    }

    #[test]
    fn rolling_needs_surge_or_unavailable() {
        let strategy = RolloutStrategy::Rolling(RollingConfig {
            max_surge: 0,
            max_unavailable: 0,
            ..Default::default()
        });
        assert!(matches!(strategy.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn canary_steps_validated() {
        for steps in [vec![10, 50], vec![50, 10, 100], vec![0, 100], vec![10, 10, 100]] {
            let strategy = RolloutStrategy::Canary(CanaryConfig {
                steps: steps.clone(),
                ..Default::default()
            });
            assert!(strategy.validate().is_err(), "{steps:?} accepted");
        }
    }

    #[test]
    fn deserializes_with_defaults() {
        let strategy: RolloutStrategy =
            serde_json::from_str(r#"{"canary":{"steps":[25,100]}}"#).unwrap();
        match strategy {
            RolloutStrategy::Canary(cfg) => {
                assert_eq!(cfg.steps, vec![25, 100]);
                assert_eq!(cfg.canary_instances, 1);
                assert_eq!(cfg.bake_secs, 300);
            }
            other => panic!("expected Canary, got {other:?}"),
        }

        let strategy: RolloutStrategy = serde_json::from_str(r#"{"blue_green":{}}"#).unwrap();
        assert_eq!(strategy.name(), "blue_green");
    }
}
