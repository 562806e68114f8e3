//! FleetStore: redb-backed checkpoints of the fleet record.
//!
//! The reconciler writes one checkpoint per committed tick: the fleet state,
//! the tick number and any rollout records touched in that tick, in a
//! single write transaction. Rollout records are stored as opaque JSON so this
//! crate does not depend on the rollout engine's types.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::fleet::FleetState;
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe fleet store backed by redb.
#[derive(Clone)]
pub struct FleetStore {
    db: Arc<Database>,
}

impl FleetStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "fleet store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory fleet store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(FLEET).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Checkpoints ────────────────────────────────────────────────

    /// Persist the fleet record, the tick it was committed in and the given
    /// rollout records atomically.
    pub fn checkpoint<R: Serialize>(
        &self,
        fleet: &FleetState,
        tick: u64,
        rollouts: &[(&str, &R)],
    ) -> StateResult<()> {
        let fleet_value = serde_json::to_vec(fleet).map_err(map_err!(Serialize))?;
        let mut encoded = Vec::with_capacity(rollouts.len());
        for (id, rollout) in rollouts {
            let value = serde_json::to_vec(rollout).map_err(map_err!(Serialize))?;
            encoded.push((*id, value));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut fleet_table = txn.open_table(FLEET).map_err(map_err!(Table))?;
            fleet_table
                .insert(FLEET_KEY, fleet_value.as_slice())
                .map_err(map_err!(Write))?;
            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            counters.insert(TICK_KEY, tick).map_err(map_err!(Write))?;
        }
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            for (id, value) in &encoded {
                table
                    .insert(*id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            tick,
            workers = fleet.workers.len(),
            rollouts = encoded.len(),
            "fleet checkpoint stored"
        );
        Ok(())
    }

    /// Load the last checkpointed fleet record.
    pub fn load_fleet(&self) -> StateResult<Option<FleetState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FLEET).map_err(map_err!(Table))?;
        match table.get(FLEET_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let fleet: FleetState =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(fleet))
            }
            None => Ok(None),
        }
    }

    /// Tick of the last checkpoint, 0 for a fresh store.
    pub fn load_tick(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        Ok(table
            .get(TICK_KEY)
            .map_err(map_err!(Read))?
            .map_or(0, |guard| guard.value()))
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// List all rollout records.
    pub fn list_rollouts<R: DeserializeOwned>(&self) -> StateResult<Vec<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollout: R =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(rollout);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Worker;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        id: String,
        step: u32,
    }

    fn test_fleet() -> FleetState {
        let mut fleet = FleetState::new("v1", 1, 6, 2).unwrap();
        fleet.push_worker(Worker::provisioning("w-1", "v1", 1000));
        fleet.push_worker(Worker::provisioning("w-2", "v1", 1001));
        fleet
    }

    #[test]
    fn checkpoint_and_load() {
        let store = FleetStore::open_in_memory().unwrap();
        let fleet = test_fleet();
        let record = Record {
            id: "ro-1".to_string(),
            step: 2,
        };

        store.checkpoint(&fleet, 7, &[("ro-1", &record)]).unwrap();

        assert_eq!(store.load_fleet().unwrap(), Some(fleet));
        assert_eq!(store.load_tick().unwrap(), 7);
        let back: Vec<Record> = store.list_rollouts().unwrap();
        assert_eq!(back, vec![record]);
    }

    #[test]
    fn empty_store_has_no_fleet() {
        let store = FleetStore::open_in_memory().unwrap();
        assert!(store.load_fleet().unwrap().is_none());
        assert_eq!(store.load_tick().unwrap(), 0);
        assert!(store.list_rollouts::<Record>().unwrap().is_empty());
    }

    #[test]
    fn checkpoint_overwrites_fleet() {
        let store = FleetStore::open_in_memory().unwrap();
        let mut fleet = test_fleet();
        store.checkpoint::<Record>(&fleet, 1, &[]).unwrap();

        fleet.desired_capacity = 4;
        store.checkpoint::<Record>(&fleet, 2, &[]).unwrap();

        let loaded = store.load_fleet().unwrap().unwrap();
        assert_eq!(loaded.desired_capacity, 4);
        assert_eq!(store.load_tick().unwrap(), 2);
    }

    #[test]
    fn rollout_records_accumulate() {
        let store = FleetStore::open_in_memory().unwrap();
        let fleet = test_fleet();
        let a = Record {
            id: "ro-1".to_string(),
            step: 0,
        };
        let b = Record {
            id: "ro-2".to_string(),
            step: 1,
        };
        store.checkpoint(&fleet, 1, &[("ro-1", &a)]).unwrap();
        store.checkpoint(&fleet, 2, &[("ro-2", &b)]).unwrap();

        let all: Vec<Record> = store.list_rollouts().unwrap();
        assert_eq!(all, vec![a, b]);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fleet.redb");

        {
            let store = FleetStore::open(&db_path).unwrap();
            store.checkpoint::<Record>(&test_fleet(), 12, &[]).unwrap();
        }

        let store = FleetStore::open(&db_path).unwrap();
        let fleet = store.load_fleet().unwrap().unwrap();
        assert_eq!(fleet.workers.len(), 2);
        assert_eq!(store.load_tick().unwrap(), 12);
        assert_eq!(fleet.stable_version, "v1");
    }
}
