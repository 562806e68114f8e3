//! fleetgrid-health: worker probes and health tracking.
//!
//! The reconciler probes every live worker once per tick. Raw probe results
//! are debounced per worker by a [`HealthTracker`] before they change the
//! worker's recorded health, so a single missed probe does not make a
//! worker a preferred scale-in candidate or fail a rollout gate.
//!
//! # Architecture
//!
//! ```text
//! HealthProbe::check(worker) → ProbeStatus { ready, live }
//!   └── HealthTracker (consecutive failures / successes)
//!         └── HealthStatus written to the worker by the reconciler
//! ```

pub mod probe;
pub mod tracker;

pub use probe::{HealthProbe, ProbeBoard, ProbeStatus};
pub use tracker::{HealthConfig, HealthTracker, ProbeResult};
