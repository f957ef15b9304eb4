//! Caller-side helpers: send a control call and report plain success.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use clusterwatch_core::ExecutionContext;
use clusterwatch_state::CheckType;

use crate::error::BusError;
use crate::message::{Call, NotificationChannel, Target};

/// Sends control calls to health managers on one topic.
///
/// Every method returns `true` only if the call completed successfully
/// within the life-check timeout. Timeouts, missing listeners and remote
/// errors all come back as `false`; the caller decides whether to retry
/// or fall back to a broadcast.
#[derive(Clone)]
pub struct Notifier {
    channel: Arc<dyn NotificationChannel>,
    topic: String,
    timeout: Duration,
}

impl Notifier {
    pub fn new(channel: Arc<dyn NotificationChannel>, topic: &str, timeout: Duration) -> Self {
        Self {
            channel,
            topic: topic.to_string(),
            timeout,
        }
    }

    /// Call `engine_id`, or broadcast when it is `None`.
    ///
    /// Uses a fresh admin context since callers here act outside any
    /// end-user request.
    pub async fn notify(&self, engine_id: Option<&str>, call: Call) -> bool {
        self.notify_with_context(None, engine_id, call).await
    }

    pub async fn notify_with_context(
        &self,
        ctx: Option<ExecutionContext>,
        engine_id: Option<&str>,
        call: Call,
    ) -> bool {
        let ctx = ctx.unwrap_or_else(ExecutionContext::admin);
        let target = match engine_id {
            Some(id) => Target::server(&self.topic, id),
            None => Target::broadcast(&self.topic),
        };
        let method = call.method();

        match self.channel.call(target.clone(), ctx, call, self.timeout).await {
            Ok(()) => {
                debug!(%target, method, "notification delivered");
                true
            }
            Err(BusError::Timeout(after)) => {
                warn!(%target, method, timeout = ?after, "notification timed out");
                false
            }
            Err(e) => {
                warn!(%target, method, error = %e, "notification failed");
                false
            }
        }
    }

    /// Ask a health manager to start checking `cluster_id`.
    pub async fn register(
        &self,
        cluster_id: &str,
        engine_id: Option<&str>,
        check_type: CheckType,
        interval: Option<u64>,
        params: serde_json::Value,
    ) -> bool {
        let call = Call::RegisterCluster {
            cluster_id: cluster_id.to_string(),
            check_type,
            interval,
            params,
        };
        self.notify(engine_id, call).await
    }

    /// Ask health managers to stop checking `cluster_id`.
    ///
    /// Broadcast is the usual form: only the owner has anything to remove
    /// and everyone else acknowledges a no-op.
    pub async fn unregister(&self, cluster_id: &str, engine_id: Option<&str>) -> bool {
        let call = Call::UnregisterCluster {
            cluster_id: cluster_id.to_string(),
        };
        self.notify(engine_id, call).await
    }

    /// Liveness probe for one engine.
    pub async fn listening(&self, engine_id: &str) -> bool {
        self.notify(Some(engine_id), Call::Listening).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBus;
    use crate::message::{BoxFuture, CallHandler};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ExecutionContext, Call)>>,
    }

    impl CallHandler for Recorder {
        fn handle(&self, ctx: ExecutionContext, call: Call) -> BoxFuture<'_, Result<(), String>> {
            self.calls.lock().unwrap().push((ctx, call));
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn register_targets_engine_with_admin_context() {
        let bus = LocalBus::new();
        let rec = Arc::new(Recorder::default());
        let _l = bus.bind("hm", "engine-1", "1.0", rec.clone()).await.unwrap();

        let notifier = Notifier::new(Arc::new(bus), "hm", Duration::from_secs(1));
        let ok = notifier
            .register(
                "c1",
                Some("engine-1"),
                CheckType::NodeStatusPolling,
                Some(10),
                serde_json::json!({}),
            )
            .await;
        assert!(ok);

        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.is_admin);
        assert!(matches!(&calls[0].1, Call::RegisterCluster { cluster_id, interval: Some(10), .. } if cluster_id == "c1"));
    }

    #[tokio::test]
    async fn unregister_broadcast_without_listeners_is_false() {
        let notifier = Notifier::new(Arc::new(LocalBus::new()), "hm", Duration::from_secs(1));
        assert!(!notifier.unregister("c1", None).await);
    }

    #[tokio::test]
    async fn listening_reports_bound_engine() {
        let bus = LocalBus::new();
        let rec = Arc::new(Recorder::default());
        let _l = bus.bind("hm", "engine-1", "1.0", rec).await.unwrap();

        let notifier = Notifier::new(Arc::new(bus), "hm", Duration::from_secs(1));
        assert!(notifier.listening("engine-1").await);
        assert!(!notifier.listening("engine-2").await);
    }

    #[tokio::test]
    async fn explicit_context_is_passed_through() {
        let bus = LocalBus::new();
        let rec = Arc::new(Recorder::default());
        let _l = bus.bind("hm", "engine-1", "1.0", rec.clone()).await.unwrap();

        let notifier = Notifier::new(Arc::new(bus), "hm", Duration::from_secs(1));
        let ctx = ExecutionContext::service("caller");
        let request_id = ctx.request_id.clone();
        assert!(
            notifier
                .notify_with_context(Some(ctx), Some("engine-1"), Call::Listening)
                .await
        );

        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls[0].0.request_id, request_id);
    }
}
