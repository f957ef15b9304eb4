//! Standalone mode — every engine in one process.
//!
//! 1. Load and validate the config
//! 2. Open the registry store
//! 3. Start `n` health managers on one local bus
//! 4. Seed `[[registrations]]` through the first engine
//! 5. On Ctrl-C, stop every engine

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use clusterwatch_bus::{Call, LocalBus, NotificationChannel, Notifier, Target};
use clusterwatch_core::{generate_engine_id, ClusterwatchConfig, ExecutionContext, RegistrationConfig};
use clusterwatch_health::{HealthManager, LoggingBackend};
use clusterwatch_state::{CheckType, RegistryStore, StateStore};

const DB_FILE: &str = "clusterwatch.redb";

pub async fn run_standalone(
    config_path: Option<PathBuf>,
    data_dir: PathBuf,
    engines: usize,
) -> anyhow::Result<()> {
    if engines == 0 {
        anyhow::bail!("--engines must be at least 1");
    }

    let config = match &config_path {
        Some(path) => ClusterwatchConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClusterwatchConfig::default(),
    };
    let settings = config.settings();
    info!(engines, config = ?config_path, "clusterwatch daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?.with_engine_dead_timeout(settings.engine_dead_timeout);
    info!(path = ?db_path, "registry store opened");

    let bus = LocalBus::new();
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

    let mut managers: Vec<Arc<HealthManager>> = Vec::with_capacity(engines);
    for _ in 0..engines {
        let mgr = HealthManager::new(
            &generate_engine_id(&host),
            settings.clone(),
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            Arc::new(LoggingBackend),
        );
        if let Err(e) = mgr.start().await {
            // Unwind the ones already up before failing startup.
            stop_all(&managers).await;
            return Err(e).with_context(|| format!("starting {}", mgr.engine_id()));
        }
        managers.push(mgr);
    }

    let channel: Arc<dyn NotificationChannel> = Arc::new(bus.clone());
    let notifier = Notifier::new(channel, &settings.topic, settings.engine_life_check_timeout);
    if let Some(first) = managers.first() {
        for reg in config.registrations.iter().flatten() {
            seed(&notifier, first.engine_id(), reg).await;
        }
    }

    roll_call(&bus, &settings.topic, settings.engine_life_check_timeout).await;
    info!(engines = managers.len(), "all engines running; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");

    stop_all(&managers).await;
    info!("clusterwatch daemon stopped");
    Ok(())
}

async fn stop_all(managers: &[Arc<HealthManager>]) {
    for mgr in managers {
        let report = mgr.stop().await;
        info!(
            engine_id = %mgr.engine_id(),
            completed = report.completed,
            aborted = report.aborted,
            "engine stopped"
        );
    }
}

/// Broadcast a liveness probe and log which engines answered.
async fn roll_call(bus: &LocalBus, topic: &str, timeout: std::time::Duration) {
    let replies = bus
        .gather(Target::broadcast(topic), ExecutionContext::admin(), Call::Listening, timeout)
        .await;
    match replies {
        Ok(replies) => {
            for (engine_id, reply) in &replies {
                if let Err(e) = reply {
                    warn!(%engine_id, error = %e, "engine not listening");
                }
            }
            let listening = replies.iter().filter(|(_, reply)| reply.is_ok()).count();
            info!(%topic, listening, "roll call complete");
        }
        Err(e) => warn!(%topic, error = %e, "roll call failed"),
    }
}

/// Register one configured cluster. Failures are logged, not fatal: an
/// existing subscription from a previous run is the common case.
async fn seed(notifier: &Notifier, engine_id: &str, reg: &RegistrationConfig) {
    let check_type: CheckType = match reg.check_type.parse() {
        Ok(t) => t,
        Err(e) => {
            warn!(cluster_id = %reg.cluster_id, error = %e, "skipping registration");
            return;
        }
    };
    let params = match reg.params_json() {
        Ok(p) => p,
        Err(e) => {
            warn!(cluster_id = %reg.cluster_id, error = %e, "skipping registration");
            return;
        }
    };
    if notifier
        .register(&reg.cluster_id, Some(engine_id), check_type, reg.interval, params)
        .await
    {
        info!(cluster_id = %reg.cluster_id, %engine_id, "seeded registration");
    } else {
        warn!(cluster_id = %reg.cluster_id, %engine_id, "seed registration not accepted");
    }
}

/// Dump the registry without starting any engine.
pub fn list(data_dir: &Path) -> anyhow::Result<()> {
    let store = StateStore::open(&data_dir.join(DB_FILE))?;
    let view = serde_json::json!({
        "subscriptions": store.list()?,
        "engines": store.list_engines()?,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
