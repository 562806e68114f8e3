//! Autoscaler: turns a metric sample and a policy into a capacity delta.

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleetgrid_metrics::{MetricScope, MetricSource};
use fleetgrid_state::*;

const SECS_PER_DAY: u64 = 86_400;

/// A proposed capacity change and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    /// Capacity delta, already clamped to the fleet's bounds.
    pub delta: i32,
    pub reason: ScaleReason,
}

impl ScalingDecision {
    fn hold(reason: ScaleReason) -> Self {
        Self { delta: 0, reason }
    }

    /// An operator override moving desired capacity from `current` to `desired`.
    pub fn manual(current: u32, desired: u32) -> Self {
        Self {
            delta: (i64::from(desired) - i64::from(current)) as i32,
            reason: ScaleReason::Manual { desired },
        }
    }

    /// Whether applying this decision changes nothing.
    pub fn is_noop(&self) -> bool {
        self.delta == 0
    }
}

/// Why the autoscaler decided what it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ScaleReason {
    /// No sample of the policy metric is available.
    NoSample,
    /// Observed value is within the dead band around the target.
    DeadBand { observed: f64, target: f64 },
    /// Target tracking proposed the delta.
    TargetTracking { observed: f64, target: f64 },
    /// A step range proposed the delta.
    Step { observed: f64 },
    /// No step range contains the observed value.
    NoMatchingStep { observed: f64 },
    /// A scheduled window proposed the delta.
    Scheduled { capacity: u32 },
    /// Outside every scheduled window, or already at the window capacity.
    OutsideWindow,
    /// The proposal would leave [min, max] and was clamped to nothing.
    AtBound,
    /// Suppressed: the previous action is too recent.
    Cooldown { remaining_secs: u64 },
    /// Scale-out applied inside the cooldown because the ceiling was exceeded.
    Emergency { observed: f64, ceiling: f64 },
    /// Operator override of the desired capacity.
    Manual { desired: u32 },
}

impl std::fmt::Display for ScaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSample => f.write_str("no sample"),
            Self::DeadBand { observed, target } => {
                write!(f, "dead band (observed {observed:.1}, target {target:.1})")
            }
            Self::TargetTracking { observed, target } => {
                write!(f, "target tracking (observed {observed:.1}, target {target:.1})")
            }
            Self::Step { observed } => write!(f, "step (observed {observed:.1})"),
            Self::NoMatchingStep { observed } => {
                write!(f, "no matching step (observed {observed:.1})")
            }
            Self::Scheduled { capacity } => write!(f, "scheduled capacity {capacity}"),
            Self::OutsideWindow => f.write_str("outside scheduled windows"),
            Self::AtBound => f.write_str("at capacity bound"),
            Self::Cooldown { remaining_secs } => {
                write!(f, "cooldown ({remaining_secs}s remaining)")
            }
            Self::Emergency { observed, ceiling } => {
                write!(f, "emergency (observed {observed:.1} > ceiling {ceiling:.1})")
            }
            Self::Manual { desired } => write!(f, "manual override to {desired}"),
        }
    }
}

/// Candidate deltas of one evaluation, before clamping and cooldown.
struct Candidates {
    scale_out: Option<i64>,
    scale_in: Option<i64>,
    observed: Option<f64>,
    reason: ScaleReason,
}

/// Evaluates scaling policies.
#[derive(Debug, Default)]
pub struct Autoscaler {
    last_decision: Option<ScalingDecision>,
}

impl Autoscaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent decision, for status reporting.
    pub fn last_decision(&self) -> Option<&ScalingDecision> {
        self.last_decision.as_ref()
    }

    /// Evaluate the policy against the latest fleet-wide sample.
    pub fn evaluate(
        &mut self,
        now: Timestamp,
        metrics: &dyn MetricSource,
        policy: &ScalingPolicy,
        state: &FleetState,
    ) -> ScalingDecision {
        let decision = decide(now, metrics, policy, state);
        if !decision.is_noop() {
            debug!(
                delta = decision.delta,
                desired = state.desired_capacity,
                reason = %decision.reason,
                "autoscaler proposes capacity change"
            );
        }
        self.last_decision = Some(decision.clone());
        decision
    }
}

fn decide(
    now: Timestamp,
    metrics: &dyn MetricSource,
    policy: &ScalingPolicy,
    state: &FleetState,
) -> ScalingDecision {
    let current = i64::from(state.desired_capacity);

    let candidates = match candidates(now, metrics, policy, current, state) {
        Ok(c) => c,
        Err(reason) => return ScalingDecision::hold(reason),
    };

    // Scale-out takes priority over scale-in.
    let Some(raw) = candidates.scale_out.or(candidates.scale_in) else {
        return ScalingDecision::hold(candidates.reason);
    };

    let delta = i64::from(state.clamp(current + raw)) - current;
    if delta == 0 {
        return ScalingDecision::hold(ScaleReason::AtBound);
    }

    if let Some(last) = state.last_scale_action {
        let elapsed = now.saturating_sub(last);
        if elapsed < policy.cooldown_secs {
            let emergency = delta > 0
                && candidates
                    .observed
                    .is_some_and(|o| o > policy.emergency_ceiling);
            if !emergency {
                return ScalingDecision::hold(ScaleReason::Cooldown {
                    remaining_secs: policy.cooldown_secs - elapsed,
                });
            }
            return ScalingDecision {
                delta: delta as i32,
                reason: ScaleReason::Emergency {
                    observed: candidates.observed.unwrap_or_default(),
                    ceiling: policy.emergency_ceiling,
                },
            };
        }
    }

    ScalingDecision {
        delta: delta as i32,
        reason: candidates.reason,
    }
}

fn candidates(
    now: Timestamp,
    metrics: &dyn MetricSource,
    policy: &ScalingPolicy,
    current: i64,
    state: &FleetState,
) -> Result<Candidates, ScaleReason> {
    match &policy.rule {
        ScalingRule::TargetTracking { target } => {
            let observed = observe(metrics, policy)?;
            let target = *target;
            if (observed - target).abs() <= policy.dead_band * target {
                return Err(ScaleReason::DeadBand { observed, target });
            }
            let raw = (current as f64 * (observed / target - 1.0)).ceil() as i64;
            Ok(Candidates {
                scale_out: (raw > 0).then_some(raw),
                scale_in: (raw < 0).then_some(raw),
                observed: Some(observed),
                reason: ScaleReason::TargetTracking { observed, target },
            })
        }
        ScalingRule::Step { steps } => {
            let observed = observe(metrics, policy)?;
            let matching: Vec<i64> = steps
                .iter()
                .filter(|s| s.contains(observed))
                .map(|s| i64::from(s.delta))
                .collect();
            if matching.is_empty() {
                return Err(ScaleReason::NoMatchingStep { observed });
            }
            // Overlapping ranges are a misconfiguration; the larger delta wins.
            Ok(Candidates {
                scale_out: matching.iter().copied().filter(|d| *d > 0).max(),
                scale_in: matching.iter().copied().filter(|d| *d < 0).max(),
                observed: Some(observed),
                reason: ScaleReason::Step { observed },
            })
        }
        ScalingRule::Scheduled { windows } => {
            let secs_of_day = (now % SECS_PER_DAY) as u32;
            let window = windows
                .iter()
                .find(|w| w.contains(secs_of_day))
                .ok_or(ScaleReason::OutsideWindow)?;
            let raw = i64::from(state.clamp(i64::from(window.capacity))) - current;
            if raw == 0 {
                return Err(ScaleReason::OutsideWindow);
            }
            Ok(Candidates {
                scale_out: (raw > 0).then_some(raw),
                scale_in: (raw < 0).then_some(raw),
                observed: None,
                reason: ScaleReason::Scheduled {
                    capacity: window.capacity,
                },
            })
        }
    }
}

fn observe(metrics: &dyn MetricSource, policy: &ScalingPolicy) -> Result<f64, ScaleReason> {
    metrics
        .sample(&policy.metric, &MetricScope::Fleet)
        .map(|s| s.value)
        .ok_or(ScaleReason::NoSample)
}
