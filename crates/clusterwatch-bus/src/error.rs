//! Notification channel error types.

use thiserror::Error;

/// Errors that can occur delivering a control call.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("no reply within {0:?}")]
    Timeout(std::time::Duration),

    #[error("no listener bound for {0}")]
    NoListener(String),

    #[error("{topic}/{engine_id} is already bound")]
    AlreadyBound { topic: String, engine_id: String },

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("listener went away before replying")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;
