//! Health manager error types.

use thiserror::Error;

use clusterwatch_bus::BusError;
use clusterwatch_state::StateError;

/// Errors surfaced by health manager operations.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("cluster {0} already has a health subscription")]
    DuplicateSubscription(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("registry store unavailable: {0}")]
    Store(StateError),

    #[error("notification channel error: {0}")]
    Bus(#[from] BusError),

    #[error("health manager is not running")]
    NotRunning,

    #[error("health manager is already running")]
    AlreadyRunning,
}

impl From<StateError> for HealthError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::DuplicateSubscription(cluster_id) => {
                HealthError::DuplicateSubscription(cluster_id)
            }
            other => HealthError::Store(other),
        }
    }
}

pub type HealthResult<T> = Result<T, HealthError>;
