//! fleetgrid-autoscale: metric-driven capacity decisions.
//!
//! Reads the fleet-wide sample of the policy's metric, compares it with the
//! policy, and proposes a capacity delta. The autoscaler never touches the
//! fleet itself: the reconciler arbitrates the returned decision against
//! rollout proposals and applies it.
//!
//! # Scaling Algorithm
//!
//! ```text
//! target tracking:
//!     if |observed - target| <= dead_band * target: no change
//!     delta = ceil(desired * (observed / target - 1))
//!
//! step:
//!     delta = largest delta among ranges containing observed
//!
//! scheduled:
//!     delta = clamp(window.capacity) - desired   (inside a daily window)
//!
//! delta is clamped so desired + delta stays within [min, max].
//!
//! if now - last_scale_action < cooldown:
//!     scale-out with observed > emergency_ceiling → applied anyway
//!     otherwise → suppressed ("cooldown")
//! ```
//!
//! Scale-out and scale-in candidates are computed independently; when both
//! exist in the same evaluation, scale-out wins.

pub mod scaler;

pub use scaler::{Autoscaler, ScaleReason, ScalingDecision};
