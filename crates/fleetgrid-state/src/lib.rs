//! fleetgrid-state: the authoritative fleet record.
//!
//! Holds the worker set, capacity bounds, cohort tables, and scaling policy
//! that the reconciler mutates, plus the invariant checks every
//! reconciliation pass runs against a planned state before any side effect
//! is issued.
//!
//! # Architecture
//!
//! ```text
//! FleetState
//!   ├── workers (Vec<Worker>, creation order)
//!   ├── desired / min / max capacity
//!   ├── active_rollout → RolloutId
//!   └── last_scale_action (cooldown)
//!
//! CohortSet: version → { worker ids, traffic weight }
//! FleetStore: redb checkpoints of FleetState and rollout records
//! ```
//!
//! All persisted types are JSON-serialized into redb's `&[u8]` value
//! columns. `FleetStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`).

pub mod cohort;
pub mod error;
pub mod fleet;
pub mod invariants;
pub mod policy;
pub mod store;
pub mod tables;
pub mod types;

pub use cohort::{Cohort, CohortSet};
pub use error::{FleetError, FleetResult, StateError, StateResult};
pub use fleet::FleetState;
pub use invariants::check_invariants;
pub use policy::{ScalingPolicy, ScalingRule, ScheduledWindow, StepRange};
pub use store::FleetStore;
pub use types::*;
