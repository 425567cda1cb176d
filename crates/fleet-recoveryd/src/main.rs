use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fleet_recovery::{
    format_recovery_prompt, CheckpointCleanupService, CheckpointCoordinator, DetectionOptions,
    FleetStore,
    InMemoryFleetStore, InactivityAlert, InactivityDetector, InactivityHandler, InactivityMonitor,
    RecoveryConfig, RecoveryDetector, RestoreOptions, SqliteFleetStore, StateRestorer,
    StoreBackend,
};
use tracing_subscriber::EnvFilter;

/// Logs inactive missions and restores them when auto resume is on.
struct ResumeHandler<S: FleetStore> {
    restorer: Arc<StateRestorer<S>>,
}

#[async_trait]
impl<S: FleetStore + 'static> InactivityHandler for ResumeHandler<S> {
    async fn on_inactive(&self, alert: InactivityAlert) {
        let candidate = alert.candidate;
        tracing::warn!(
            mission_id = %candidate.mission_id,
            inactive_ms = candidate.inactivity_duration_ms,
            checkpoint_id = candidate.checkpoint_id.as_deref().unwrap_or("-"),
            "mission inactive, recovery available"
        );
        if !alert.should_auto_resume {
            return;
        }
        let restorer = Arc::clone(&self.restorer);
        let mission_id = candidate.mission_id.clone();
        let restored = tokio::task::spawn_blocking(move || {
            restorer.restore_latest(&mission_id, RestoreOptions::default())
        })
        .await;
        match restored {
            Ok(Ok(result)) => {
                tracing::info!("{}", format_recovery_prompt(&result));
            }
            Ok(Err(err)) => {
                tracing::error!(mission_id = %candidate.mission_id, error = %err, "auto resume failed")
            }
            Err(err) => {
                tracing::error!(mission_id = %candidate.mission_id, error = %err, "auto resume panicked")
            }
        }
    }
}

/// Restores or announces every mission found stale at startup. A stale mission
/// with no checkpoint gets a manual one so it can be resumed later.
fn startup_recovery<S: FleetStore>(
    store: S,
    restorer: &StateRestorer<S>,
    coordinator: &CheckpointCoordinator<S>,
    config: &RecoveryConfig,
) -> Result<()> {
    let options = DetectionOptions {
        activity_threshold_ms: config.inactivity.threshold_ms,
        include_completed: false,
    };
    let candidates = RecoveryDetector::new(store).detect_recovery_candidates(&options)?;
    for candidate in candidates {
        if !candidate.has_checkpoint() {
            let details = format!(
                "Inactive for {} ms at daemon startup",
                candidate.inactivity_duration_ms
            );
            match coordinator.manual(&candidate.mission_id, "fleet-recoveryd", Some(details)) {
                Some(checkpoint) => tracing::info!(
                    mission_id = %candidate.mission_id,
                    checkpoint_id = %checkpoint.id,
                    ttl_hours = checkpoint.ttl_hours,
                    "stale mission had no checkpoint, took one"
                ),
                None => tracing::warn!(
                    mission_id = %candidate.mission_id,
                    "stale mission has no checkpoint and taking one failed"
                ),
            }
            continue;
        }
        if !config.inactivity.auto_resume {
            tracing::info!(
                mission_id = %candidate.mission_id,
                title = %candidate.mission_title,
                checkpoint_id = candidate.checkpoint_id.as_deref().unwrap_or("-"),
                "recovery available"
            );
            continue;
        }
        let result = restorer.restore_latest(&candidate.mission_id, RestoreOptions::default())?;
        tracing::info!("{}", format_recovery_prompt(&result));
    }
    Ok(())
}

async fn run<S: FleetStore + Clone + 'static>(store: S, config: RecoveryConfig) -> Result<()> {
    let restorer = Arc::new(StateRestorer::new(store.clone()));
    let coordinator = config.checkpoint_coordinator(store.clone());
    startup_recovery(store.clone(), &restorer, &coordinator, &config)?;

    let monitor = InactivityMonitor::new(
        store.clone(),
        InactivityDetector::new(config.inactivity.clone()),
        Arc::new(ResumeHandler {
            restorer: Arc::clone(&restorer),
        }),
        config.monitor_interval_ms,
    );
    let cleanup = CheckpointCleanupService::new(store, config.cleanup.clone());
    monitor.start();
    if !cleanup.start() {
        tracing::info!("automatic checkpoint cleanup disabled");
    }
    tracing::info!(
        monitor_interval_ms = config.monitor_interval_ms,
        inactivity_threshold_ms = config.inactivity.threshold_ms,
        auto_resume = config.inactivity.auto_resume,
        checkpoint_ttl_hours = config.checkpoint_ttl_hours,
        "fleet recovery daemon running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    monitor.stop().await;
    cleanup.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fleet_recovery=info")),
        )
        .init();

    let config = RecoveryConfig::from_env("fleet_recovery.db").map_err(|e| anyhow!(e))?;
    match config.backend {
        StoreBackend::Sqlite => {
            let store = SqliteFleetStore::open(&config.sqlite_db_path)?;
            tracing::info!(db = %config.sqlite_db_path, "opened sqlite store");
            run(store, config).await
        }
        StoreBackend::Memory => {
            tracing::warn!("in-memory store: recovery state is lost on exit");
            run(InMemoryFleetStore::new(), config).await
        }
    }
}
