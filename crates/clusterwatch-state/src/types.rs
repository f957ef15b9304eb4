//! Domain types for the registry store.
//!
//! These types represent the persisted health subscriptions and engine
//! liveness records. All types are serializable to/from JSON for storage
//! in redb tables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a managed cluster.
pub type ClusterId = String;

/// Unique identifier for an engine instance.
pub type EngineId = String;

// ── Check type ────────────────────────────────────────────────────

/// How a cluster's health is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckType {
    /// Poll node status on a timer.
    NodeStatusPolling,
    /// React to cluster-scoped lifecycle events.
    LifecycleEvents,
    /// React to hypervisor-level lifecycle events.
    VmLifecycleEvents,
}

#[derive(Debug, Error)]
#[error("unknown check type: {0}")]
pub struct UnknownCheckType(pub String);

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::NodeStatusPolling => "NODE_STATUS_POLLING",
            CheckType::LifecycleEvents => "LIFECYCLE_EVENTS",
            CheckType::VmLifecycleEvents => "VM_LIFECYCLE_EVENTS",
        }
    }

    /// Whether this check is timer-driven. Event-driven checks get no timer.
    pub fn is_polling(&self) -> bool {
        matches!(self, CheckType::NodeStatusPolling)
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = UnknownCheckType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NODE_STATUS_POLLING" => Ok(CheckType::NodeStatusPolling),
            "LIFECYCLE_EVENTS" => Ok(CheckType::LifecycleEvents),
            "VM_LIFECYCLE_EVENTS" => Ok(CheckType::VmLifecycleEvents),
            _ => Err(UnknownCheckType(s.to_string())),
        }
    }
}

// ── Subscription ──────────────────────────────────────────────────

/// A cluster's registered health check and its current owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub cluster_id: ClusterId,
    /// Engine currently executing the checks.
    pub engine_id: EngineId,
    pub check_type: CheckType,
    /// Polling period in seconds. Only meaningful for polling check types.
    pub interval: Option<u64>,
    /// Opaque check parameters, passed through untouched.
    pub params: serde_json::Value,
    /// Unix timestamp (seconds) when this subscription was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last ownership change.
    pub updated_at: u64,
}

impl Subscription {
    /// Timer period for this subscription, capped at `max`.
    ///
    /// `None` for event-driven checks or when no positive interval is set.
    pub fn effective_interval(&self, max: Duration) -> Option<Duration> {
        if !self.check_type.is_polling() {
            return None;
        }
        match self.interval {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs).min(max)),
            _ => None,
        }
    }
}

/// Fields supplied by a caller registering a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewSubscription {
    pub cluster_id: ClusterId,
    pub check_type: CheckType,
    pub interval: Option<u64>,
    pub params: serde_json::Value,
}

impl NewSubscription {
    pub fn new(cluster_id: &str, check_type: CheckType, interval: Option<u64>) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            check_type,
            interval,
            params: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

// ── Engine ────────────────────────────────────────────────────────

/// Liveness record of one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineRecord {
    pub engine_id: EngineId,
    pub topic: String,
    pub version: String,
    /// Unix timestamp of the last heartbeat.
    pub last_seen: u64,
}

impl EngineRecord {
    /// Whether this engine has gone quiet for longer than `dead_after`.
    pub fn is_dead(&self, now: u64, dead_after: Duration) -> bool {
        now.saturating_sub(self.last_seen) > dead_after.as_secs()
    }
}
