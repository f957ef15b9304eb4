//! Recovery dispatch — turns a timer firing into a remote cluster check.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use clusterwatch_bus::BoxFuture;
use clusterwatch_core::ExecutionContext;

/// The backend that actually runs a cluster's health check and any
/// recovery it triggers.
pub trait ExecutionBackend: Send + Sync {
    fn cluster_check(
        &self,
        ctx: ExecutionContext,
        cluster_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// How a single dispatch ended. Never propagated as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Failed,
    TimedOut,
}

/// Fires check calls on behalf of one engine.
pub struct RecoveryDispatcher {
    backend: Arc<dyn ExecutionBackend>,
    engine_id: String,
    timeout: Duration,
}

impl RecoveryDispatcher {
    pub fn new(backend: Arc<dyn ExecutionBackend>, engine_id: &str, timeout: Duration) -> Self {
        Self {
            backend,
            engine_id: engine_id.to_string(),
            timeout,
        }
    }

    /// Run one check for `cluster_id`.
    ///
    /// Failures and timeouts are logged and swallowed; the next scheduled
    /// firing is the retry.
    pub async fn dispatch(&self, cluster_id: &str) -> DispatchOutcome {
        let ctx = ExecutionContext::service(&self.engine_id);
        let request_id = ctx.request_id.clone();
        debug!(%cluster_id, %request_id, "dispatching cluster check");

        let call = self.backend.cluster_check(ctx, cluster_id);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => {
                debug!(%cluster_id, %request_id, "cluster check completed");
                DispatchOutcome::Completed
            }
            Ok(Err(e)) => {
                warn!(%cluster_id, %request_id, error = %e, "cluster check failed");
                DispatchOutcome::Failed
            }
            Err(_) => {
                warn!(%cluster_id, %request_id, timeout = ?self.timeout, "cluster check timed out");
                DispatchOutcome::TimedOut
            }
        }
    }
}

/// Backend that only records the request in the log.
#[derive(Debug, Default)]
pub struct LoggingBackend;

impl ExecutionBackend for LoggingBackend {
    fn cluster_check(
        &self,
        ctx: ExecutionContext,
        cluster_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        info!(%cluster_id, request_id = %ctx.request_id, engine_id = ?ctx.engine_id, "cluster check requested");
        Box::pin(async { Ok(()) })
    }
}
