//! Scaling policy: what the autoscaler steers capacity by.

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};

const SECS_PER_DAY: u32 = 86_400;

/// Autoscaling policy of a fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    /// Metric to scale on (e.g. "cpu", "rps"). Ignored by `Scheduled`.
    #[serde(default)]
    pub metric: String,
    pub rule: ScalingRule,
    /// Minimum interval between two applied scaling actions.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Fraction of the target inside which no action is taken.
    #[serde(default = "default_dead_band")]
    pub dead_band: f64,
    /// Observed value above which scale-out ignores the cooldown.
    #[serde(default = "default_emergency_ceiling")]
    pub emergency_ceiling: f64,
}

/// How the policy turns an observation into a capacity delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalingRule {
    /// Keep the metric near `target`.
    TargetTracking { target: f64 },
    /// Apply the delta of the range containing the observed value.
    Step { steps: Vec<StepRange> },
    /// Hold a fixed capacity during daily UTC windows.
    Scheduled { windows: Vec<ScheduledWindow> },
}

/// One step range: `lower <= value < upper` maps to `delta`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRange {
    pub lower: f64,
    /// Open-ended when absent.
    #[serde(default)]
    pub upper: Option<f64>,
    pub delta: i32,
}

impl StepRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && self.upper.is_none_or(|u| value < u)
    }
}

/// A daily window, in seconds since UTC midnight: `start_secs <= t < end_secs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledWindow {
    pub start_secs: u32,
    pub end_secs: u32,
    pub capacity: u32,
}

impl ScheduledWindow {
    pub fn contains(&self, secs_of_day: u32) -> bool {
        secs_of_day >= self.start_secs && secs_of_day < self.end_secs
    }
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_dead_band() -> f64 {
    0.05
}

fn default_emergency_ceiling() -> f64 {
    95.0
}

impl ScalingPolicy {
    /// Target tracking on `metric` with default cooldown, dead band, and ceiling.
    pub fn target_tracking(metric: &str, target: f64) -> Self {
        Self::with_rule(metric, ScalingRule::TargetTracking { target })
    }

    /// Step scaling on `metric`.
    pub fn step(metric: &str, steps: Vec<StepRange>) -> Self {
        Self::with_rule(metric, ScalingRule::Step { steps })
    }

    /// Scheduled capacity windows.
    pub fn scheduled(windows: Vec<ScheduledWindow>) -> Self {
        Self::with_rule("", ScalingRule::Scheduled { windows })
    }

    fn with_rule(metric: &str, rule: ScalingRule) -> Self {
        Self {
            metric: metric.to_string(),
            rule,
            cooldown_secs: default_cooldown_secs(),
            dead_band: default_dead_band(),
            emergency_ceiling: default_emergency_ceiling(),
        }
    }

    /// Set the cooldown window.
    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    /// Reject malformed policies before they reach the autoscaler.
    pub fn validate(&self) -> FleetResult<()> {
        if !(0.0..1.0).contains(&self.dead_band) {
            return Err(config(format!(
                "dead band {} must be in [0, 1)",
                self.dead_band
            )));
        }
        if !(self.emergency_ceiling.is_finite() && self.emergency_ceiling > 0.0) {
            return Err(config(format!(
                "emergency ceiling {} must be positive",
                self.emergency_ceiling
            )));
        }

        match &self.rule {
            ScalingRule::TargetTracking { target } => {
                self.require_metric()?;
                if !(target.is_finite() && *target > 0.0) {
                    return Err(config(format!("target {target} must be positive")));
                }
            }
            ScalingRule::Step { steps } => {
                self.require_metric()?;
                validate_steps(steps)?;
            }
            ScalingRule::Scheduled { windows } => validate_windows(windows)?,
        }
        Ok(())
    }

    fn require_metric(&self) -> FleetResult<()> {
        if self.metric.trim().is_empty() {
            return Err(config("metric name must not be empty".to_string()));
        }
        Ok(())
    }
}

fn validate_steps(steps: &[StepRange]) -> FleetResult<()> {
    if steps.is_empty() {
        return Err(config("step policy needs at least one range".to_string()));
    }
    for (i, step) in steps.iter().enumerate() {
        if let Some(upper) = step.upper
            && upper <= step.lower
        {
            return Err(config(format!(
                "step {i}: upper bound {upper} not above lower bound {}",
                step.lower
            )));
        }
        if step.delta == 0 {
            return Err(config(format!("step {i}: delta must be non-zero")));
        }
    }
    for (i, pair) in steps.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        match prev.upper {
            None => {
                return Err(config(format!(
                    "step {i}: only the last range may be open-ended"
                )));
            }
            Some(upper) if upper > next.lower => {
                return Err(config(format!(
                    "steps {i} and {} overlap or are out of order",
                    i + 1
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn validate_windows(windows: &[ScheduledWindow]) -> FleetResult<()> {
    if windows.is_empty() {
        return Err(config("scheduled policy needs at least one window".to_string()));
    }
    for (i, w) in windows.iter().enumerate() {
        if w.start_secs >= w.end_secs || w.end_secs > SECS_PER_DAY {
            return Err(config(format!(
                "window {i}: [{}, {}) is not a valid daily window",
                w.start_secs, w.end_secs
            )));
        }
    }
    Ok(())
}

fn config(msg: String) -> FleetError {
    FleetError::Config(msg)
}
