//! Health manager — one per engine instance.
//!
//! Owns the engine's share of health subscriptions: claims them at start,
//! keeps them in an in-memory set, drives their timers through the
//! scheduler actor, and answers `register_cluster` / `unregister_cluster` /
//! `listening` calls arriving over the notification channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use clusterwatch_bus::{BoxFuture, Call, CallHandler, Listener, NotificationChannel};
use clusterwatch_core::{epoch_secs, ExecutionContext, HealthSettings};
use clusterwatch_state::{
    CheckType, ClusterId, EngineRecord, NewSubscription, RegistryStore, Subscription,
};

use crate::claim::claim_ownership;
use crate::dispatcher::{ExecutionBackend, RecoveryDispatcher};
use crate::error::{HealthError, HealthResult};
use crate::scheduler::{FireFn, Job, Scheduler, ShutdownReport};

/// Resources that exist only while the manager is running.
struct Running {
    scheduler: Scheduler,
    listener: Listener,
}

/// Health monitoring service for a single engine.
pub struct HealthManager {
    engine_id: String,
    settings: HealthSettings,
    store: Arc<dyn RegistryStore>,
    channel: Arc<dyn NotificationChannel>,
    dispatcher: Arc<RecoveryDispatcher>,
    /// Owned subscriptions: cluster_id → subscription.
    registries: RwLock<HashMap<ClusterId, Subscription>>,
    /// Serializes start, stop, register and unregister on this engine.
    running: Mutex<Option<Running>>,
    alive: AtomicBool,
}

impl HealthManager {
    pub fn new(
        engine_id: &str,
        settings: HealthSettings,
        store: Arc<dyn RegistryStore>,
        channel: Arc<dyn NotificationChannel>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Arc<Self> {
        let dispatcher = RecoveryDispatcher::new(backend, engine_id, settings.dispatch_timeout);
        Arc::new(Self {
            engine_id: engine_id.to_string(),
            settings,
            store,
            channel,
            dispatcher: Arc::new(dispatcher),
            registries: RwLock::new(HashMap::new()),
            running: Mutex::new(None),
            alive: AtomicBool::new(false),
        })
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Start the manager.
    ///
    /// Claims ownership before any timer is installed. A store failure here
    /// aborts startup: the manager never schedules with an unknown set.
    pub async fn start(self: &Arc<Self>) -> HealthResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(HealthError::AlreadyRunning);
        }

        self.store
            .touch_engine(&engine_record(&self.engine_id, &self.settings))
            .map_err(HealthError::Store)?;
        let owned = claim_ownership(self.store.as_ref(), &self.engine_id)
            .map_err(HealthError::Store)?;

        let snapshot = owned.clone();
        {
            let mut registries = self.registries.write().await;
            *registries = owned
                .into_iter()
                .map(|sub| (sub.cluster_id.clone(), sub))
                .collect();
        }

        let scheduler = Scheduler::spawn(self.fire_fn());
        let installed = self.install_timers(&scheduler, &snapshot).await;
        if let Err(e) = installed {
            scheduler.shutdown(self.settings.dispatch_timeout).await;
            return Err(e);
        }

        let handler: Arc<dyn CallHandler> = Arc::clone(self) as Arc<dyn CallHandler>;
        let listener = match self
            .channel
            .bind(&self.settings.topic, &self.engine_id, &self.settings.version, handler)
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                scheduler.shutdown(self.settings.dispatch_timeout).await;
                return Err(e.into());
            }
        };

        self.alive.store(true, Ordering::Release);
        *running = Some(Running { scheduler, listener });
        info!(
            engine_id = %self.engine_id,
            owned = snapshot.len(),
            interval_max = ?self.settings.periodic_interval_max,
            "health manager started"
        );
        Ok(())
    }

    async fn install_timers(
        &self,
        scheduler: &Scheduler,
        owned: &[Subscription],
    ) -> HealthResult<()> {
        scheduler
            .add(Job::Heartbeat, self.settings.periodic_interval)
            .await?;
        for sub in owned {
            if let Some(period) = sub.effective_interval(self.settings.periodic_interval_max) {
                scheduler.add(Job::Check(sub.cluster_id.clone()), period).await?;
            }
        }
        Ok(())
    }

    /// Stop the manager.
    ///
    /// Unbinds from the channel, cancels every timer and waits (bounded by
    /// `dispatch_timeout`) for in-flight checks. No check is dispatched
    /// after this returns.
    pub async fn stop(&self) -> ShutdownReport {
        let mut running = self.running.lock().await;
        let Some(Running { scheduler, listener }) = running.take() else {
            debug!(engine_id = %self.engine_id, "stop called while not running");
            return ShutdownReport::default();
        };

        self.alive.store(false, Ordering::Release);
        listener.close().await;
        let report = scheduler.shutdown(self.settings.dispatch_timeout).await;

        // Without a liveness record our subscriptions are claimable at once.
        if let Err(e) = self.store.remove_engine(&self.engine_id) {
            warn!(engine_id = %self.engine_id, error = %e, "failed to remove engine record");
        }
        self.registries.write().await.clear();

        info!(
            engine_id = %self.engine_id,
            completed = report.completed,
            aborted = report.aborted,
            "health manager stopped"
        );
        report
    }

    /// Liveness probe: true while the manager is running.
    pub fn listening(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Register a cluster for health checking, owned by this engine.
    ///
    /// Fails with `DuplicateSubscription` if the cluster is already
    /// registered anywhere, and with `NotRunning` on a stopped manager.
    /// Polling checks get their timer before this returns.
    pub async fn register_cluster(
        &self,
        cluster_id: &str,
        check_type: CheckType,
        interval: Option<u64>,
        params: serde_json::Value,
    ) -> HealthResult<Subscription> {
        if cluster_id.trim().is_empty() {
            return Err(HealthError::InvalidRequest("cluster_id is empty".to_string()));
        }
        if check_type.is_polling() && !matches!(interval, Some(secs) if secs > 0) {
            return Err(HealthError::InvalidRequest(format!(
                "{check_type} requires a positive interval"
            )));
        }
        let params = match params {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other,
        };
        let new = NewSubscription {
            cluster_id: cluster_id.to_string(),
            check_type,
            interval,
            params,
        };

        let running = self.running.lock().await;
        let Some(rt) = running.as_ref() else {
            return Err(HealthError::NotRunning);
        };
        let sub = self.store.create(&new, &self.engine_id)?;
        self.registries
            .write()
            .await
            .insert(sub.cluster_id.clone(), sub.clone());

        if let Some(period) = sub.effective_interval(self.settings.periodic_interval_max) {
            if let Err(e) = rt.scheduler.add(Job::Check(sub.cluster_id.clone()), period).await {
                // Undo so a retry is not refused as a duplicate.
                self.registries.write().await.remove(cluster_id);
                if let Err(undo) = self.store.delete(cluster_id) {
                    error!(%cluster_id, error = %undo, "failed to roll back subscription");
                }
                return Err(e);
            }
        }

        info!(
            engine_id = %self.engine_id,
            %cluster_id,
            %check_type,
            ?interval,
            "cluster registered for health checks"
        );
        Ok(sub)
    }

    /// Stop health checking a cluster. Idempotent.
    ///
    /// Once this returns no new check for the cluster will start on this
    /// engine; one already in flight may still finish.
    pub async fn unregister_cluster(&self, cluster_id: &str) -> HealthResult<()> {
        let running = self.running.lock().await;
        let existed = self.store.delete(cluster_id)?;
        let owned = self.registries.write().await.remove(cluster_id).is_some();

        if let Some(rt) = running.as_ref() {
            rt.scheduler.cancel(Job::Check(cluster_id.to_string())).await?;
        }

        if existed || owned {
            info!(engine_id = %self.engine_id, %cluster_id, "cluster unregistered");
        } else {
            debug!(engine_id = %self.engine_id, %cluster_id, "unregister for unknown cluster");
        }
        Ok(())
    }

    /// Snapshot of the owned set, sorted by cluster ID.
    pub async fn registries(&self) -> Vec<Subscription> {
        let registries = self.registries.read().await;
        let mut subs: Vec<Subscription> = registries.values().cloned().collect();
        subs.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        subs
    }

    /// Cluster IDs that currently have a timer installed.
    pub async fn scheduled(&self) -> HealthResult<Vec<ClusterId>> {
        let running = self.running.lock().await;
        let rt = running.as_ref().ok_or(HealthError::NotRunning)?;
        let jobs = rt.scheduler.scheduled().await?;
        Ok(jobs
            .into_iter()
            .filter_map(|job| match job {
                Job::Check(cluster_id) => Some(cluster_id),
                Job::Heartbeat => None,
            })
            .collect())
    }

    /// Build the scheduler callback. Captures only what a firing needs,
    /// never the manager itself or its locks.
    fn fire_fn(&self) -> FireFn {
        let dispatcher = Arc::clone(&self.dispatcher);
        let store = Arc::clone(&self.store);
        let engine_id = self.engine_id.clone();
        let settings = self.settings.clone();

        Arc::new(move |job: Job| -> BoxFuture<'static, ()> {
            let dispatcher = Arc::clone(&dispatcher);
            let store = Arc::clone(&store);
            let record = engine_record(&engine_id, &settings);
            Box::pin(async move {
                match job {
                    Job::Heartbeat => {
                        if let Err(e) = store.touch_engine(&record) {
                            error!(engine_id = %record.engine_id, error = %e, "heartbeat failed to refresh engine record");
                        } else {
                            debug!(engine_id = %record.engine_id, "heartbeat");
                        }
                    }
                    Job::Check(cluster_id) => {
                        dispatcher.dispatch(&cluster_id).await;
                    }
                }
            })
        })
    }
}

impl CallHandler for HealthManager {
    fn handle(&self, ctx: ExecutionContext, call: Call) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            debug!(
                engine_id = %self.engine_id,
                request_id = %ctx.request_id,
                method = call.method(),
                "inbound call"
            );
            if !ctx.is_admin {
                return Err("admin context required".to_string());
            }
            match call {
                Call::RegisterCluster {
                    cluster_id,
                    check_type,
                    interval,
                    params,
                } => self
                    .register_cluster(&cluster_id, check_type, interval, params)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                Call::UnregisterCluster { cluster_id } => self
                    .unregister_cluster(&cluster_id)
                    .await
                    .map_err(|e| e.to_string()),
                Call::Listening => {
                    if self.listening() {
                        Ok(())
                    } else {
                        Err("not listening".to_string())
                    }
                }
            }
        })
    }
}

fn engine_record(engine_id: &str, settings: &HealthSettings) -> EngineRecord {
    EngineRecord {
        engine_id: engine_id.to_string(),
        topic: settings.topic.clone(),
        version: settings.version.clone(),
        last_seen: epoch_secs(),
    }
}
