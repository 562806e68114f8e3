//! redb table definitions for the fleet store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized
//! records); counters are plain `u64`s.

use redb::TableDefinition;

/// The fleet record, stored under [`FLEET_KEY`].
pub const FLEET: TableDefinition<&str, &[u8]> = TableDefinition::new("fleet");

/// Rollout records keyed by rollout id.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Key of the single fleet record.
pub const FLEET_KEY: &str = "fleet";

/// Monotonic counters that must survive a restart.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Last committed reconciliation tick; idempotency tokens are derived from it.
pub const TICK_KEY: &str = "tick";
