//! fleetgrid-rollout: progressive delivery of a new version.
//!
//! This crate provides the rollout state machine for moving a live fleet
//! from its stable version to a target version. It supports rolling
//! updates (one replacement at a time within surge/unavailability bounds),
//! blue-green switches (parallel cohort, single traffic flip, drain window)
//! and canary deployments (bonus capacity, weighted steps, metric bakes).
//!
//! # Components
//!
//! - **`strategy`**: Strategy configuration (Rolling, BlueGreen, Canary)
//! - **`rollout`**: The rollout record, phases, approval and cancellation
//! - **`engine`**: Per-tick state machine producing [`RolloutProposal`]s
//!
//! # Phases
//!
//! ```text
//! Pending ──▶ InProgress ──▶ Baking ──▶ Completed
//!    │             │            │
//!    └─────────────┴────────────┴──▶ Failed / RolledBack (+ restoration)
//! ```

pub mod engine;
pub mod rollout;
pub mod strategy;

pub use engine::{RolloutEngine, RolloutProposal};
pub use rollout::{Progress, Restore, Rollout, RolloutPhase, RolloutSpec, RolloutView};
pub use strategy::{BlueGreenConfig, CanaryConfig, MetricThreshold, RollingConfig, RolloutStrategy};
