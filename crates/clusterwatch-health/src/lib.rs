//! clusterwatch-health — distributed health monitoring for managed clusters.
//!
//! Every engine instance runs one `HealthManager`. Any engine may be asked
//! to register or unregister a cluster, but exactly one engine owns and
//! runs the periodic checks for a given cluster at any time.
//!
//! # Architecture
//!
//! ```text
//! HealthManager
//!   ├── start()
//!   │   ├── touch own engine record in the RegistryStore
//!   │   ├── claim_ownership() → owned subscriptions (incl. orphans)
//!   │   ├── Scheduler actor ← Add(heartbeat), Add(check) per polling sub
//!   │   └── bind to the NotificationChannel as (topic, engine_id)
//!   ├── register_cluster / unregister_cluster / listening (inbound calls)
//!   └── stop() → unbind, cancel timers, drain in-flight firings
//!
//! Scheduler actor
//!   ├── BinaryHeap keyed by next fire time
//!   └── firing → spawned task → RecoveryDispatcher::dispatch()
//!                                  └── ExecutionBackend::cluster_check()
//! ```
//!
//! # Ownership
//!
//! Ownership is claimed once, at start. An engine that dies leaves its
//! subscriptions in place; the next engine to start claims them. There is
//! no background re-claim while engines are running.

pub mod claim;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod scheduler;

pub use claim::claim_ownership;
pub use dispatcher::{DispatchOutcome, ExecutionBackend, LoggingBackend, RecoveryDispatcher};
pub use error::{HealthError, HealthResult};
pub use manager::HealthManager;
pub use scheduler::{Job, Scheduler, ShutdownReport};
