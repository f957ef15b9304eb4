//! Shared types used across clusterwatch crates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity and privilege of whoever a call is made on behalf of.
///
/// Background work (timer firings, broadcast fan-out) runs outside any
/// end-user request, so it carries an explicitly synthesized admin context
/// instead of inheriting one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub request_id: String,
    pub is_admin: bool,
    /// Engine the call originates from, if any.
    pub engine_id: Option<String>,
}

impl ExecutionContext {
    /// Admin-level context for work done by an engine on its own behalf.
    pub fn service(engine_id: &str) -> Self {
        Self {
            request_id: next_request_id(),
            is_admin: true,
            engine_id: Some(engine_id.to_string()),
        }
    }

    /// Admin-level context with no originating engine.
    pub fn admin() -> Self {
        Self {
            request_id: next_request_id(),
            is_admin: true,
            engine_id: None,
        }
    }
}

fn next_request_id() -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{:x}-{seq:06}", epoch_secs())
}

/// Generate an engine ID from a host name and the current time.
pub fn generate_engine_id(host: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    host.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    REQUEST_SEQ.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    format!("engine-{:016x}", hasher.finish())
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
