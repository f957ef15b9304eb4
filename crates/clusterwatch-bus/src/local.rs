//! LocalBus — in-process notification channel.
//!
//! Each bound engine owns an mpsc inbox; every inbound call is answered on
//! its own task so a slow handler never holds up the next call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use clusterwatch_core::ExecutionContext;

use crate::error::{BusError, BusResult};
use crate::message::{BoxFuture, Call, CallHandler, NotificationChannel, Target};

/// Inbound calls buffered per engine before senders wait.
const INBOX_CAPACITY: usize = 64;

struct Envelope {
    ctx: ExecutionContext,
    call: Call,
    reply: oneshot::Sender<Result<(), String>>,
}

struct Binding {
    version: String,
    tx: mpsc::Sender<Envelope>,
}

/// topic → engine_id → binding.
type Bindings = Arc<RwLock<HashMap<String, HashMap<String, Binding>>>>;

/// Shared in-process bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    bindings: Bindings,
}

/// Handle to one engine's binding. Closing (or dropping) it unbinds.
#[derive(Debug)]
pub struct Listener {
    topic: String,
    engine_id: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Listener {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// Unbind and wait for the receive loop to exit.
    ///
    /// Calls already handed to a handler still run to completion.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// List `(topic, engine_id, version)` for every bound engine.
    pub async fn bindings(&self) -> Vec<(String, String, String)> {
        let bindings = self.bindings.read().await;
        let mut out: Vec<_> = bindings
            .iter()
            .flat_map(|(topic, engines)| {
                engines.iter().map(move |(engine_id, b)| {
                    (topic.clone(), engine_id.clone(), b.version.clone())
                })
            })
            .collect();
        out.sort();
        out
    }

    async fn bind_inner(
        &self,
        topic: &str,
        engine_id: &str,
        version: &str,
        handler: Arc<dyn CallHandler>,
    ) -> BusResult<Listener> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        {
            let mut bindings = self.bindings.write().await;
            let engines = bindings.entry(topic.to_string()).or_default();
            if engines.contains_key(engine_id) {
                return Err(BusError::AlreadyBound {
                    topic: topic.to_string(),
                    engine_id: engine_id.to_string(),
                });
            }
            engines.insert(
                engine_id.to_string(),
                Binding {
                    version: version.to_string(),
                    tx,
                },
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_listener(
            Arc::clone(&self.bindings),
            topic.to_string(),
            engine_id.to_string(),
            handler,
            rx,
            shutdown_rx,
        ));

        info!(%topic, %engine_id, %version, "listener bound");
        Ok(Listener {
            topic: topic.to_string(),
            engine_id: engine_id.to_string(),
            shutdown_tx,
            handle,
        })
    }

    /// Senders for every binding `target` addresses.
    async fn recipients(&self, target: &Target) -> BusResult<Vec<(String, mpsc::Sender<Envelope>)>> {
        let bindings = self.bindings.read().await;
        let senders: Vec<_> = match bindings.get(&target.topic) {
            Some(engines) => match &target.server {
                Some(server) => engines
                    .get(server)
                    .map(|b| vec![(server.clone(), b.tx.clone())])
                    .unwrap_or_default(),
                None => engines
                    .iter()
                    .map(|(id, b)| (id.clone(), b.tx.clone()))
                    .collect(),
            },
            None => Vec::new(),
        };
        if senders.is_empty() {
            return Err(BusError::NoListener(target.to_string()));
        }
        Ok(senders)
    }

    /// Deliver `call` and collect every recipient's reply, sorted by engine.
    ///
    /// Unlike `call`, this waits for all recipients. Replies still missing
    /// at `timeout` are left out; if none arrived the result is `Timeout`.
    pub async fn gather(
        &self,
        target: Target,
        ctx: ExecutionContext,
        call: Call,
        timeout: Duration,
    ) -> BusResult<Vec<(String, Result<(), String>)>> {
        let senders = self.recipients(&target).await?;
        let mut replies = JoinSet::new();
        for (engine_id, tx) in senders {
            let (reply_tx, reply_rx) = oneshot::channel();
            let envelope = Envelope {
                ctx: ctx.clone(),
                call: call.clone(),
                reply: reply_tx,
            };
            if tx.send(envelope).await.is_err() {
                continue;
            }
            replies.spawn(async move { (engine_id, reply_rx.await) });
        }

        let mut collected = Vec::new();
        let finished = tokio::time::timeout(timeout, async {
            while let Some(joined) = replies.join_next().await {
                if let Ok((engine_id, Ok(reply))) = joined {
                    collected.push((engine_id, reply));
                }
            }
        })
        .await;
        replies.abort_all();

        if finished.is_err() && collected.is_empty() {
            return Err(BusError::Timeout(timeout));
        }
        collected.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(collected)
    }

    async fn call_inner(
        &self,
        target: Target,
        ctx: ExecutionContext,
        call: Call,
        timeout: Duration,
    ) -> BusResult<()> {
        let senders = self.recipients(&target).await?;
        let method = call.method();
        let deliver = async {
            // Hand the call to every recipient before waiting on any reply,
            // so an early success never keeps a broadcast from landing.
            let mut replies = JoinSet::new();
            for (engine_id, tx) in senders {
                let (reply_tx, reply_rx) = oneshot::channel();
                let envelope = Envelope {
                    ctx: ctx.clone(),
                    call: call.clone(),
                    reply: reply_tx,
                };
                if tx.send(envelope).await.is_err() {
                    debug!(%engine_id, method, "listener closed before delivery");
                    continue;
                }
                replies.spawn(async move { (engine_id, reply_rx.await) });
            }

            let mut last_err = BusError::Closed;
            while let Some(joined) = replies.join_next().await {
                match joined {
                    Ok((_, Ok(Ok(())))) => return Ok(()),
                    Ok((engine_id, Ok(Err(msg)))) => {
                        debug!(%engine_id, method, error = %msg, "remote call failed");
                        last_err = BusError::Remote(msg);
                    }
                    Ok((engine_id, Err(_))) => {
                        debug!(%engine_id, method, "reply channel dropped");
                    }
                    Err(e) => {
                        debug!(method, error = %e, "reply waiter failed");
                    }
                }
            }
            Err(last_err)
        };

        match tokio::time::timeout(timeout, deliver).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

impl NotificationChannel for LocalBus {
    fn bind(
        &self,
        topic: &str,
        engine_id: &str,
        version: &str,
        handler: Arc<dyn CallHandler>,
    ) -> BoxFuture<'_, BusResult<Listener>> {
        let topic = topic.to_string();
        let engine_id = engine_id.to_string();
        let version = version.to_string();
        Box::pin(async move { self.bind_inner(&topic, &engine_id, &version, handler).await })
    }

    fn call(
        &self,
        target: Target,
        ctx: ExecutionContext,
        call: Call,
        timeout: Duration,
    ) -> BoxFuture<'_, BusResult<()>> {
        Box::pin(self.call_inner(target, ctx, call, timeout))
    }
}

/// Receive loop for a single binding.
async fn run_listener(
    bindings: Bindings,
    topic: String,
    engine_id: String,
    handler: Arc<dyn CallHandler>,
    mut rx: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(envelope) = msg else { break };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let reply = handler.handle(envelope.ctx, envelope.call).await;
                    let _ = envelope.reply.send(reply);
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    let mut bindings = bindings.write().await;
    if let Some(engines) = bindings.get_mut(&topic) {
        engines.remove(&engine_id);
        if engines.is_empty() {
            bindings.remove(&topic);
        }
    }
    info!(%topic, %engine_id, "listener unbound");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that counts calls, optionally stalling or failing.
    struct TestHandler {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl TestHandler {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail,
            })
        }
    }

    impl CallHandler for TestHandler {
        fn handle(&self, _ctx: ExecutionContext, _call: Call) -> BoxFuture<'_, Result<(), String>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                if self.fail {
                    Err("boom".to_string())
                } else {
                    Ok(())
                }
            })
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::admin()
    }

    #[tokio::test]
    async fn targeted_call_reaches_only_target() {
        let bus = LocalBus::new();
        let a = TestHandler::new(Duration::ZERO, false);
        let b = TestHandler::new(Duration::ZERO, false);
        let _la = bus.bind("hm", "engine-a", "1.0", a.clone()).await.unwrap();
        let _lb = bus.bind("hm", "engine-b", "1.0", b.clone()).await.unwrap();

        bus.call(Target::server("hm", "engine-a"), ctx(), Call::Listening, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn call_to_unbound_engine_fails() {
        let bus = LocalBus::new();
        let err = bus
            .call(Target::server("hm", "ghost"), ctx(), Call::Listening, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoListener(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_listener_times_out() {
        let bus = LocalBus::new();
        let slow = TestHandler::new(Duration::from_secs(10), false);
        let _l = bus.bind("hm", "engine-a", "1.0", slow).await.unwrap();

        let err = bus
            .call(Target::server("hm", "engine-a"), ctx(), Call::Listening, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
    }

    #[tokio::test]
    async fn remote_error_is_reported() {
        let bus = LocalBus::new();
        let failing = TestHandler::new(Duration::ZERO, true);
        let _l = bus.bind("hm", "engine-a", "1.0", failing).await.unwrap();

        let err = bus
            .call(Target::server("hm", "engine-a"), ctx(), Call::Listening, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Remote(msg) if msg == "boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_delivers_to_all_and_first_ok_wins() {
        let bus = LocalBus::new();
        let fast = TestHandler::new(Duration::ZERO, false);
        let slow = TestHandler::new(Duration::from_secs(30), false);
        let failing = TestHandler::new(Duration::ZERO, true);
        let _l1 = bus.bind("hm", "fast", "1.0", fast.clone()).await.unwrap();
        let _l2 = bus.bind("hm", "slow", "1.0", slow.clone()).await.unwrap();
        let _l3 = bus.bind("hm", "failing", "1.0", failing.clone()).await.unwrap();

        bus.call(Target::broadcast("hm"), ctx(), Call::Listening, Duration::from_secs(2))
            .await
            .unwrap();

        // The slow and failing handlers run on their own tasks.
        for _ in 0..100 {
            if slow.calls.load(Ordering::SeqCst) == 1 && failing.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fast.calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_binding_rejected() {
        let bus = LocalBus::new();
        let h = TestHandler::new(Duration::ZERO, false);
        let _l = bus.bind("hm", "engine-a", "1.0", h.clone()).await.unwrap();
        let err = bus.bind("hm", "engine-a", "1.0", h).await.unwrap_err();
        assert!(matches!(err, BusError::AlreadyBound { .. }));
    }

    #[tokio::test]
    async fn close_unbinds() {
        let bus = LocalBus::new();
        let h = TestHandler::new(Duration::ZERO, false);
        let listener = bus.bind("hm", "engine-a", "2.1", h).await.unwrap();
        assert_eq!(
            bus.bindings().await,
            vec![("hm".to_string(), "engine-a".to_string(), "2.1".to_string())]
        );

        listener.close().await;
        assert!(bus.bindings().await.is_empty());

        let err = bus
            .call(Target::server("hm", "engine-a"), ctx(), Call::Listening, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoListener(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn gather_collects_every_reply() {
        let bus = LocalBus::new();
        let ok = TestHandler::new(Duration::ZERO, false);
        let bad = TestHandler::new(Duration::ZERO, true);
        let slow = TestHandler::new(Duration::from_secs(10), false);
        let _l1 = bus.bind("hm", "engine-a", "1.0", ok.clone()).await.unwrap();
        let _l2 = bus.bind("hm", "engine-b", "1.0", bad.clone()).await.unwrap();
        let _l3 = bus.bind("hm", "engine-c", "1.0", slow.clone()).await.unwrap();

        let replies = bus
            .gather(Target::broadcast("hm"), ctx(), Call::Listening, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![
                ("engine-a".to_string(), Ok(())),
                ("engine-b".to_string(), Err("boom".to_string())),
            ]
        );
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    }
}
