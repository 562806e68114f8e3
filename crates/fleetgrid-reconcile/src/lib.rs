//! fleetgrid-reconcile: the single writer of fleet state.
//!
//! Each tick the reconciler collects the autoscaler's capacity decision and
//! the rollout engine's proposal, applies them to a candidate plan, checks
//! the plan against every fleet invariant, and only then drives the fleet
//! through the [`FleetDriver`]. A rejected plan applies nothing.
//!
//! # Architecture
//!
//! ```text
//! ControllerHandle ──Command──▶ FleetController (event loop, periodic ticks)
//!                                  └── Reconciler::tick
//!                                        ├── refresh health (HealthProbe)
//!                                        ├── Plan: scaling → rollout → repair
//!                                        ├── check_invariants(plan)
//!                                        └── DriverExecutor (timeout, retry)
//!                                              └── FleetDriver
//! ```
//!
//! Precedence within a tick: scaling is applied first, the rollout engine
//! then plans against the scaled fleet, and drift repair fills whatever is
//! left when no rollout is active. An active rollout only narrows which
//! workers scale-in may pick; it never blocks a scaling decision.

pub mod config;
pub mod controller;
pub mod driver;
pub mod plan;
pub mod reconciler;
pub mod sim;

pub use config::ReconcilerConfig;
pub use controller::{Clock, Command, ControllerHandle, FleetController, ManualClock, SystemClock, epoch_secs};
pub use driver::{BackoffPolicy, DriverError, DriverExecutor, FleetDriver, IdempotencyToken};
pub use plan::{Action, Origin, Plan};
pub use reconciler::{CancelBoard, FleetView, Reconciler, TickReport};
pub use sim::{SimCall, SimDriver};
