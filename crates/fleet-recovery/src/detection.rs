//! Inactivity detection: which missions went quiet and can be recovered.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RecoveryError;
use crate::models::{age_ms, Mission, MissionStatus, RecoveryCandidate};
use crate::periodic::PeriodicTask;
use crate::repository::FleetStore;

pub const DEFAULT_INACTIVITY_THRESHOLD_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 30_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InactivityConfig {
    pub threshold_ms: u64,
    pub auto_resume: bool,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            threshold_ms: DEFAULT_INACTIVITY_THRESHOLD_MS,
            auto_resume: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InactivityStatus {
    pub last_activity_at: DateTime<Utc>,
    pub inactivity_duration_ms: u64,
    pub is_inactive: bool,
    pub should_prompt_recovery: bool,
    pub should_auto_resume: bool,
}

/// Stateless staleness check. Inactive means strictly longer than the threshold.
#[derive(Clone, Debug, Default)]
pub struct InactivityDetector {
    config: InactivityConfig,
}

impl InactivityDetector {
    pub fn new(config: InactivityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InactivityConfig {
        &self.config
    }

    pub fn check(
        &self,
        last_activity_at: DateTime<Utc>,
        has_checkpoint: bool,
        now: DateTime<Utc>,
    ) -> InactivityStatus {
        let inactivity_duration_ms = age_ms(last_activity_at, now);
        let is_inactive = inactivity_duration_ms > self.config.threshold_ms;
        let should_prompt_recovery = is_inactive && has_checkpoint;
        InactivityStatus {
            last_activity_at,
            inactivity_duration_ms,
            is_inactive,
            should_prompt_recovery,
            should_auto_resume: should_prompt_recovery && self.config.auto_resume,
        }
    }
}

/// Newest event time on the mission stream, else when the mission started or was created.
pub fn last_activity<S: FleetStore>(
    store: &S,
    mission: &Mission,
) -> Result<DateTime<Utc>, RecoveryError> {
    Ok(store
        .get_latest(&mission.id)?
        .map(|event| event.occurred_at)
        .unwrap_or_else(|| mission.active_since()))
}

fn candidate_for<S: FleetStore>(
    store: &S,
    mission: &Mission,
    last_activity_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<RecoveryCandidate, RecoveryError> {
    let checkpoint = store.latest_checkpoint_for_mission(&mission.id)?;
    Ok(RecoveryCandidate {
        mission_id: mission.id.clone(),
        mission_title: mission.title.clone(),
        last_activity_at,
        inactivity_duration_ms: age_ms(last_activity_at, now),
        checkpoint_id: checkpoint.as_ref().map(|c| c.id.clone()),
        checkpoint_progress: checkpoint.as_ref().map(|c| c.progress_percent),
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectionOptions {
    pub activity_threshold_ms: u64,
    pub include_completed: bool,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            activity_threshold_ms: DEFAULT_INACTIVITY_THRESHOLD_MS,
            include_completed: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecoveryCheck {
    pub needed: bool,
    /// Only candidates that have a checkpoint to restore from.
    pub candidates: Vec<RecoveryCandidate>,
}

/// Startup batch scan pairing stale missions with their latest checkpoint.
pub struct RecoveryDetector<S: FleetStore> {
    store: S,
}

impl<S: FleetStore> RecoveryDetector<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn detect_recovery_candidates(
        &self,
        options: &DetectionOptions,
    ) -> Result<Vec<RecoveryCandidate>, RecoveryError> {
        self.detect_recovery_candidates_at(options, Utc::now())
    }

    pub fn detect_recovery_candidates_at(
        &self,
        options: &DetectionOptions,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecoveryCandidate>, RecoveryError> {
        let mut missions = self.store.missions_by_status(MissionStatus::InProgress)?;
        if options.include_completed {
            missions.extend(self.store.missions_by_status(MissionStatus::Completed)?);
        }
        let mut candidates = Vec::new();
        for mission in &missions {
            let last = last_activity(&self.store, mission)?;
            if age_ms(last, now) > options.activity_threshold_ms {
                candidates.push(candidate_for(&self.store, mission, last, now)?);
            }
        }
        Ok(candidates)
    }

    pub fn check_for_recovery(&self, options: &DetectionOptions) -> Result<RecoveryCheck, RecoveryError> {
        self.check_for_recovery_at(options, Utc::now())
    }

    pub fn check_for_recovery_at(
        &self,
        options: &DetectionOptions,
        now: DateTime<Utc>,
    ) -> Result<RecoveryCheck, RecoveryError> {
        let candidates: Vec<RecoveryCandidate> = self
            .detect_recovery_candidates_at(options, now)?
            .into_iter()
            .filter(RecoveryCandidate::has_checkpoint)
            .collect();
        log::info!(
            "recovery_check needed={} candidates={}",
            !candidates.is_empty(),
            candidates.len()
        );
        Ok(RecoveryCheck {
            needed: !candidates.is_empty(),
            candidates,
        })
    }
}

/// Delivered for each inactive mission that has a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InactivityAlert {
    pub candidate: RecoveryCandidate,
    pub should_auto_resume: bool,
}

#[async_trait]
pub trait InactivityHandler: Send + Sync {
    async fn on_inactive(&self, alert: InactivityAlert);
}

/// Periodic scan of in-progress missions.
pub struct InactivityMonitor<S: FleetStore> {
    store: S,
    detector: InactivityDetector,
    handler: Arc<dyn InactivityHandler>,
    interval_ms: u64,
    task: PeriodicTask,
}

/// One scan: alerts for every in-progress mission that is inactive and recoverable.
pub fn scan_inactive<S: FleetStore>(
    store: &S,
    detector: &InactivityDetector,
    now: DateTime<Utc>,
) -> Result<Vec<InactivityAlert>, RecoveryError> {
    let mut alerts = Vec::new();
    for mission in store.missions_by_status(MissionStatus::InProgress)? {
        let last = last_activity(store, &mission)?;
        if !detector.check(last, true, now).is_inactive {
            continue;
        }
        let candidate = candidate_for(store, &mission, last, now)?;
        let status = detector.check(last, candidate.has_checkpoint(), now);
        if status.should_prompt_recovery {
            log::info!(
                "mission_inactive mission_id={} inactive_ms={} checkpoint_id={}",
                candidate.mission_id,
                candidate.inactivity_duration_ms,
                candidate.checkpoint_id.as_deref().unwrap_or("-")
            );
            alerts.push(InactivityAlert {
                candidate,
                should_auto_resume: status.should_auto_resume,
            });
        }
    }
    Ok(alerts)
}

impl<S: FleetStore + Clone + 'static> InactivityMonitor<S> {
    pub fn new(
        store: S,
        detector: InactivityDetector,
        handler: Arc<dyn InactivityHandler>,
        interval_ms: u64,
    ) -> Self {
        Self {
            store,
            detector,
            handler,
            interval_ms,
            task: PeriodicTask::new("inactivity-monitor"),
        }
    }

    pub fn scan(&self, now: DateTime<Utc>) -> Result<Vec<InactivityAlert>, RecoveryError> {
        scan_inactive(&self.store, &self.detector, now)
    }

    /// Scans on the blocking pool every interval and hands alerts to the handler.
    pub fn start(&self) -> bool {
        let store = self.store.clone();
        let detector = self.detector.clone();
        let handler = Arc::clone(&self.handler);
        self.task
            .start(StdDuration::from_millis(self.interval_ms), move || {
                let store = store.clone();
                let detector = detector.clone();
                let handler = Arc::clone(&handler);
                async move {
                    let scanned = tokio::task::spawn_blocking(move || {
                        scan_inactive(&store, &detector, Utc::now())
                    })
                    .await;
                    let alerts = match scanned {
                        Ok(Ok(alerts)) => alerts,
                        Ok(Err(err)) => {
                            log::warn!("inactivity_scan_failed error={err}");
                            return;
                        }
                        Err(err) => {
                            log::error!("inactivity_scan_panicked error={err}");
                            return;
                        }
                    };
                    for alert in alerts {
                        handler.on_inactive(alert).await;
                    }
                }
            })
    }

    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}
