//! Error types for the clusterwatch registry store.

use thiserror::Error;

/// Result type alias for registry store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during registry store operations.
///
/// Everything except `DuplicateSubscription` means the store could not
/// do its job and is treated as the store being unavailable.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("cluster {0} already has a health subscription")]
    DuplicateSubscription(String),
}

impl StateError {
    /// Whether this is a collision on an existing `cluster_id`.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StateError::DuplicateSubscription(_))
    }
}
