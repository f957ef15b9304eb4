//! The registry-store contract consumed by the health manager.

use crate::error::StateResult;
use crate::types::*;

/// Durable table of health subscriptions plus engine liveness records.
///
/// Implementations may block on I/O. `create` and `claim` must be atomic
/// with respect to concurrent callers across all engines.
pub trait RegistryStore: Send + Sync {
    /// Persist a new subscription owned by `engine_id`.
    ///
    /// Fails with `StateError::DuplicateSubscription` if the cluster
    /// already has one.
    fn create(&self, new: &NewSubscription, engine_id: &str) -> StateResult<Subscription>;

    /// Remove a cluster's subscription. Returns true if it existed.
    fn delete(&self, cluster_id: &str) -> StateResult<bool>;

    /// Take ownership of orphaned subscriptions.
    ///
    /// Returns every subscription already owned by `engine_id` together
    /// with every subscription whose owner is dead or unknown, the latter
    /// reassigned to `engine_id`. Subscriptions of live engines are not
    /// touched.
    fn claim(&self, engine_id: &str) -> StateResult<Vec<Subscription>>;

    fn get(&self, cluster_id: &str) -> StateResult<Option<Subscription>>;

    fn list(&self) -> StateResult<Vec<Subscription>>;

    /// Insert or refresh an engine's liveness record.
    fn touch_engine(&self, record: &EngineRecord) -> StateResult<()>;

    /// Drop an engine's liveness record. Returns true if it existed.
    fn remove_engine(&self, engine_id: &str) -> StateResult<bool>;

    fn list_engines(&self) -> StateResult<Vec<EngineRecord>>;
}
