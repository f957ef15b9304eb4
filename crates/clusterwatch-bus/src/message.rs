//! Call payloads, addressing, and the channel/handler contracts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use clusterwatch_core::ExecutionContext;
use clusterwatch_state::{CheckType, ClusterId, EngineId};

use crate::error::BusResult;
use crate::local::Listener;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A control call an engine answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    RegisterCluster {
        cluster_id: ClusterId,
        check_type: CheckType,
        interval: Option<u64>,
        params: serde_json::Value,
    },
    UnregisterCluster {
        cluster_id: ClusterId,
    },
    Listening,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::RegisterCluster { .. } => "register_cluster",
            Call::UnregisterCluster { .. } => "unregister_cluster",
            Call::Listening => "listening",
        }
    }
}

/// Where a call is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub topic: String,
    /// `None` broadcasts to every engine on the topic.
    pub server: Option<EngineId>,
}

impl Target {
    pub fn server(topic: &str, engine_id: &str) -> Self {
        Self {
            topic: topic.to_string(),
            server: Some(engine_id.to_string()),
        }
    }

    pub fn broadcast(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            server: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.server.is_none()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.server {
            Some(server) => write!(f, "{}/{}", self.topic, server),
            None => write!(f, "{}/*", self.topic),
        }
    }
}

/// Server side of the channel: answers calls delivered to one engine.
///
/// An `Err` reply carries the remote failure message back to the caller.
pub trait CallHandler: Send + Sync + 'static {
    fn handle(&self, ctx: ExecutionContext, call: Call) -> BoxFuture<'_, Result<(), String>>;
}

/// Point-to-point / broadcast transport with bounded waits.
pub trait NotificationChannel: Send + Sync {
    /// Bind `handler` to receive calls for `(topic, engine_id)`.
    fn bind(
        &self,
        topic: &str,
        engine_id: &str,
        version: &str,
        handler: Arc<dyn CallHandler>,
    ) -> BoxFuture<'_, BusResult<Listener>>;

    /// Deliver `call` and wait at most `timeout` for a successful reply.
    ///
    /// Broadcasts succeed as soon as any engine replies `Ok`.
    fn call(
        &self,
        target: Target,
        ctx: ExecutionContext,
        call: Call,
        timeout: Duration,
    ) -> BoxFuture<'_, BusResult<()>>;
}
