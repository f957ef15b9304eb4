//! Ownership claim, run once when a health manager starts.

use tracing::{info, warn};

use clusterwatch_state::{RegistryStore, StateResult, Subscription};

/// Claim this engine's subscriptions plus any orphaned ones.
///
/// The store does the atomic reassignment. Rows the store hands back that
/// are not owned by `engine_id` are dropped, so a misbehaving store can
/// never make two engines run the same cluster.
pub fn claim_ownership(
    store: &dyn RegistryStore,
    engine_id: &str,
) -> StateResult<Vec<Subscription>> {
    let claimed = store.claim(engine_id)?;
    let returned = claimed.len();

    let owned: Vec<Subscription> = claimed
        .into_iter()
        .filter(|sub| {
            if sub.engine_id == engine_id {
                true
            } else {
                warn!(
                    cluster_id = %sub.cluster_id,
                    owner = %sub.engine_id,
                    %engine_id,
                    "claim returned a subscription owned elsewhere; ignoring"
                );
                false
            }
        })
        .collect();

    info!(%engine_id, owned = owned.len(), returned, "ownership claimed");
    Ok(owned)
}
