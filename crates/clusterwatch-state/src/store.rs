//! StateStore — redb-backed registry persistence.
//!
//! Implements [`RegistryStore`] over two tables: subscriptions and engine
//! liveness records. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use clusterwatch_core::epoch_secs;

use crate::error::{StateError, StateResult};
use crate::registry::RegistryStore;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe registry store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Silence after which an engine's subscriptions become claimable.
    engine_dead_timeout: Duration,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "registry store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory registry store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            engine_dead_timeout: Duration::from_secs(180),
        }
    }

    /// Set the silence after which an engine counts as dead.
    pub fn with_engine_dead_timeout(mut self, timeout: Duration) -> Self {
        self.engine_dead_timeout = timeout;
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
        txn.open_table(ENGINES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Engine IDs whose liveness record is fresh as of `now`.
    fn live_engines(&self, txn: &redb::WriteTransaction, now: u64) -> StateResult<HashSet<String>> {
        let table = txn.open_table(ENGINES).map_err(map_err!(Table))?;
        let mut live = HashSet::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: EngineRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !record.is_dead(now, self.engine_dead_timeout) {
                live.insert(record.engine_id);
            }
        }
        Ok(live)
    }
}

impl RegistryStore for StateStore {
    fn create(&self, new: &NewSubscription, engine_id: &str) -> StateResult<Subscription> {
        let now = epoch_secs();
        let sub = Subscription {
            cluster_id: new.cluster_id.clone(),
            engine_id: engine_id.to_string(),
            check_type: new.check_type,
            interval: new.interval,
            params: new.params.clone(),
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_vec(&sub).map_err(map_err!(Serialize))?;

        // Check and insert under one write transaction so racing creates
        // for the same cluster see each other.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let exists = table
                .get(sub.cluster_id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                return Err(StateError::DuplicateSubscription(sub.cluster_id));
            }
            table
                .insert(sub.cluster_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster_id = %sub.cluster_id, %engine_id, "subscription stored");
        Ok(sub)
    }

    fn delete(&self, cluster_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            existed = table.remove(cluster_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%cluster_id, existed, "subscription deleted");
        Ok(existed)
    }

    fn claim(&self, engine_id: &str) -> StateResult<Vec<Subscription>> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let live = self.live_engines(&txn, now)?;

        let mut claimed = Vec::new();
        let mut reassigned = 0usize;
        {
            let mut table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let mut all = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let sub: Subscription =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                all.push(sub);
            }

            for mut sub in all {
                if sub.engine_id == engine_id {
                    claimed.push(sub);
                    continue;
                }
                if live.contains(&sub.engine_id) {
                    continue;
                }
                let previous = std::mem::replace(&mut sub.engine_id, engine_id.to_string());
                sub.updated_at = now;
                let value = serde_json::to_vec(&sub).map_err(map_err!(Serialize))?;
                table
                    .insert(sub.cluster_id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                debug!(cluster_id = %sub.cluster_id, from = %previous, to = %engine_id, "subscription reassigned");
                reassigned += 1;
                claimed.push(sub);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        info!(%engine_id, total = claimed.len(), reassigned, "subscriptions claimed");
        Ok(claimed)
    }

    fn get(&self, cluster_id: &str) -> StateResult<Option<Subscription>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
        match table.get(cluster_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let sub: Subscription =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(sub))
            }
            None => Ok(None),
        }
    }

    fn list(&self) -> StateResult<Vec<Subscription>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let sub: Subscription =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(sub);
        }
        Ok(results)
    }

    fn touch_engine(&self, record: &EngineRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENGINES).map_err(map_err!(Table))?;
            table
                .insert(record.engine_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove_engine(&self, engine_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ENGINES).map_err(map_err!(Table))?;
            existed = table.remove(engine_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%engine_id, existed, "engine record removed");
        Ok(existed)
    }

    fn list_engines(&self) -> StateResult<Vec<EngineRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENGINES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: EngineRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }
}
