//! clusterwatch-state — durable health-check registry.
//!
//! Backed by [redb](https://docs.rs/redb), records which cluster needs
//! which check, at what cadence, and which engine owns its execution.
//! Engines also keep a liveness record here that `claim` uses to decide
//! whether an owner is gone.
//!
//! # Architecture
//!
//! Subscriptions and engine records are JSON-serialized into redb's
//! `&[u8]` value columns, keyed by `cluster_id` and `engine_id`.
//!
//! Every mutating operation runs in a single redb write transaction.
//! redb admits one writer at a time, so `create` (check-then-insert) and
//! `claim` (scan-then-reassign) are atomic across concurrent callers.
//!
//! The `RegistryStore` trait is the contract the health manager consumes;
//! `StateStore` is the redb implementation and is `Clone` + `Send` + `Sync`
//! (backed by `Arc<Database>`).

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::RegistryStore;
pub use store::StateStore;
pub use types::*;
