//! fleetgrid-metrics: observations the controller decides on.
//!
//! Samples are recorded by pollers running outside the reconciliation loop
//! and read by the autoscaler (fleet scope) and the canary bake check
//! (cohort scope). Recording a sample never touches fleet state; pollers
//! nudge the controller with an event instead.
//!
//! # Architecture
//!
//! ```text
//! pollers ──record()──▶ MetricsRegistry ──sample()──▶ Autoscaler / RolloutEngine
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain gauges of fleet state
//! ```

pub mod prometheus;
pub mod registry;
pub mod source;

pub use prometheus::render_prometheus;
pub use registry::MetricsRegistry;
pub use source::{MetricSample, MetricScope, MetricSource};
