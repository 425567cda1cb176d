//! Checkpoint retention.
//!
//! Per mission the `keep_per_mission` newest checkpoints are never deleted; older
//! ones go once they are past `ttl_days`. Completed missions are skipped unless
//! configured otherwise. Checkpoints whose mission no longer exists are treated
//! like those of an active mission.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use fleet_kernel::{CheckpointsCleanedData, EventPayload, StreamType};

use crate::error::RecoveryError;
use crate::models::{Checkpoint, MissionStatus};
use crate::periodic::PeriodicTask;
use crate::repository::FleetStore;

/// Stream that receives `checkpoints_cleaned` events.
pub const CLEANUP_STREAM_ID: &str = "checkpoint-cleanup";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupConfig {
    pub ttl_days: u32,
    pub keep_per_mission: usize,
    pub include_completed_missions: bool,
    pub cleanup_interval_ms: u64,
    pub auto_cleanup: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            ttl_days: 7,
            keep_per_mission: 3,
            include_completed_missions: false,
            cleanup_interval_ms: 24 * 60 * 60 * 1000,
            auto_cleanup: true,
        }
    }
}

impl CleanupConfig {
    fn ttl(&self) -> Duration {
        Duration::days(i64::from(self.ttl_days))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted: u64,
    pub missions_scanned: u64,
    pub missions_skipped: u64,
    pub failed: u64,
}

/// Read-only view of the checkpoint table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub total: u64,
    /// Past their own `ttl_hours`.
    pub expired: u64,
    /// Older than the retention window.
    pub past_retention: u64,
    pub consumed: u64,
    pub missions: u64,
}

/// One pass of the retention policy.
pub fn run_cleanup<S: FleetStore>(
    store: &S,
    config: &CleanupConfig,
    now: DateTime<Utc>,
) -> Result<CleanupReport, RecoveryError> {
    let mut by_mission: BTreeMap<String, Vec<Checkpoint>> = BTreeMap::new();
    for checkpoint in store.list_checkpoints()? {
        by_mission
            .entry(checkpoint.mission_id.clone())
            .or_default()
            .push(checkpoint);
    }

    let mut report = CleanupReport::default();
    for (mission_id, mut checkpoints) in by_mission {
        report.missions_scanned += 1;
        let completed = store
            .get_mission(&mission_id)?
            .is_some_and(|m| m.status == MissionStatus::Completed);
        if completed && !config.include_completed_missions {
            report.missions_skipped += 1;
            continue;
        }
        checkpoints.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        for checkpoint in checkpoints.iter().skip(config.keep_per_mission) {
            if now - checkpoint.timestamp <= config.ttl() {
                continue;
            }
            match store.delete_checkpoint(&checkpoint.id) {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(err) => {
                    report.failed += 1;
                    log::warn!(
                        "checkpoint_delete_failed mission_id={} checkpoint_id={} error={}",
                        mission_id,
                        checkpoint.id,
                        err
                    );
                }
            }
        }
    }

    if report.deleted > 0 {
        let payload = EventPayload::CheckpointsCleaned(CheckpointsCleanedData {
            deleted: report.deleted,
            missions_scanned: report.missions_scanned,
        });
        if let Err(err) = store.append(StreamType::Checkpoint, CLEANUP_STREAM_ID, payload) {
            log::warn!("cleanup_event_failed error={err}");
        }
    }
    log::info!(
        "checkpoint_cleanup deleted={} missions_scanned={} missions_skipped={} failed={}",
        report.deleted,
        report.missions_scanned,
        report.missions_skipped,
        report.failed
    );
    Ok(report)
}

pub struct CheckpointCleanupService<S: FleetStore> {
    store: S,
    config: CleanupConfig,
    task: PeriodicTask,
}

impl<S: FleetStore + Clone + 'static> CheckpointCleanupService<S> {
    pub fn new(store: S, config: CleanupConfig) -> Self {
        Self {
            store,
            config,
            task: PeriodicTask::new("checkpoint-cleanup"),
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    pub fn cleanup(&self) -> Result<CleanupReport, RecoveryError> {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport, RecoveryError> {
        run_cleanup(&self.store, &self.config, now)
    }

    pub fn get_stats(&self) -> Result<CleanupStats, RecoveryError> {
        self.get_stats_at(Utc::now())
    }

    pub fn get_stats_at(&self, now: DateTime<Utc>) -> Result<CleanupStats, RecoveryError> {
        let checkpoints = self.store.list_checkpoints()?;
        let mut missions: Vec<&str> = checkpoints.iter().map(|c| c.mission_id.as_str()).collect();
        missions.sort_unstable();
        missions.dedup();
        Ok(CleanupStats {
            total: checkpoints.len() as u64,
            expired: checkpoints.iter().filter(|c| c.is_expired(now)).count() as u64,
            past_retention: checkpoints
                .iter()
                .filter(|c| now - c.timestamp > self.config.ttl())
                .count() as u64,
            consumed: checkpoints.iter().filter(|c| c.consumed).count() as u64,
            missions: missions.len() as u64,
        })
    }

    /// Starts the timer when auto cleanup is enabled. Each pass runs on the
    /// blocking pool; a failed pass is logged and the next tick tries again.
    pub fn start(&self) -> bool {
        if !self.config.auto_cleanup {
            return false;
        }
        let store = self.store.clone();
        let config = self.config.clone();
        self.task.start(
            StdDuration::from_millis(self.config.cleanup_interval_ms),
            move || {
                let store = store.clone();
                let config = config.clone();
                async move {
                    let pass =
                        tokio::task::spawn_blocking(move || run_cleanup(&store, &config, Utc::now()))
                            .await;
                    match pass {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => log::error!("checkpoint_cleanup_failed error={err}"),
                        Err(err) => log::error!("checkpoint_cleanup_panicked error={err}"),
                    }
                }
            },
        )
    }

    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}
