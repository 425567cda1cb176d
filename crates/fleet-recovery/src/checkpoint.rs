//! Checkpoint creation and the coordinator wiring triggers to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use fleet_kernel::{CheckpointCreatedData, EventPayload, StreamType};

use crate::error::RecoveryError;
use crate::models::{
    BlockerInfo, Checkpoint, CheckpointTrigger, LockSnapshot, MessageSnapshot, SortieSnapshot,
};
use crate::narrative::build_recovery_context;
use crate::repository::FleetStore;
use crate::triggers::{ErrorTrigger, ErrorTriggerConfig, ProgressTrigger, ProgressTriggerConfig};

pub const DEFAULT_CHECKPOINT_TTL_HOURS: u32 = 168;

#[derive(Clone, Debug)]
pub struct CheckpointOptions {
    pub created_by: String,
    pub trigger_details: Option<String>,
    /// Derived from the mission's sortie counts when absent.
    pub progress_percent: Option<u8>,
    pub blockers: Vec<BlockerInfo>,
    pub ttl_hours: Option<u32>,
}

impl CheckpointOptions {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            trigger_details: None,
            progress_percent: None,
            blockers: Vec::new(),
            ttl_hours: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.trigger_details = Some(details.into());
        self
    }

    pub fn with_progress(mut self, progress_percent: u8) -> Self {
        self.progress_percent = Some(progress_percent.min(100));
        self
    }

    pub fn with_blockers(mut self, blockers: Vec<BlockerInfo>) -> Self {
        self.blockers = blockers;
        self
    }

    pub fn with_ttl_hours(mut self, ttl_hours: u32) -> Self {
        self.ttl_hours = Some(ttl_hours);
        self
    }
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self::new("system")
    }
}

/// Assembles, persists and announces checkpoints.
pub struct CheckpointCreator<S: FleetStore> {
    store: S,
    default_ttl_hours: u32,
}

impl<S: FleetStore> CheckpointCreator<S> {
    pub fn new(store: S) -> Self {
        Self::with_default_ttl(store, DEFAULT_CHECKPOINT_TTL_HOURS)
    }

    pub fn with_default_ttl(store: S, default_ttl_hours: u32) -> Self {
        Self {
            store,
            default_ttl_hours,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn create_checkpoint(
        &self,
        mission_id: &str,
        trigger: CheckpointTrigger,
        options: CheckpointOptions,
    ) -> Result<Checkpoint, RecoveryError> {
        self.create_checkpoint_at(mission_id, trigger, options, Utc::now())
    }

    /// Snapshots the mission, stores the checkpoint, then appends `checkpoint_created`.
    ///
    /// The event is best effort: once the checkpoint is persisted an append
    /// failure is only logged.
    pub fn create_checkpoint_at(
        &self,
        mission_id: &str,
        trigger: CheckpointTrigger,
        options: CheckpointOptions,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint, RecoveryError> {
        let mission = self
            .store
            .get_mission(mission_id)?
            .ok_or_else(|| RecoveryError::not_found("mission", mission_id))?;
        let sorties: Vec<SortieSnapshot> = self
            .store
            .sorties_by_mission(mission_id)?
            .iter()
            .map(SortieSnapshot::from)
            .collect();
        let active_locks: Vec<LockSnapshot> = self
            .store
            .active_locks_for_mission(mission_id)?
            .iter()
            .map(LockSnapshot::from)
            .collect();
        let pending_messages: Vec<MessageSnapshot> = self
            .store
            .pending_messages(mission_id)?
            .iter()
            .map(MessageSnapshot::from)
            .collect();
        let latest_event = self.store.get_latest(mission_id)?;
        let recovery_context = build_recovery_context(
            &mission,
            &sorties,
            latest_event.as_ref(),
            options.blockers,
            now,
        );

        let checkpoint = Checkpoint {
            id: format!("ckpt-{}", Uuid::new_v4()),
            mission_id: mission.id.clone(),
            trigger,
            trigger_details: options.trigger_details,
            progress_percent: options
                .progress_percent
                .unwrap_or_else(|| mission.progress_percent()),
            created_by: options.created_by,
            timestamp: now,
            sorties,
            active_locks,
            pending_messages,
            recovery_context,
            ttl_hours: options.ttl_hours.unwrap_or(self.default_ttl_hours),
            consumed: false,
        };
        self.store.create_checkpoint(&checkpoint)?;
        log::info!(
            "checkpoint_created mission_id={} checkpoint_id={} trigger={} progress={} sorties={} locks={} messages={}",
            checkpoint.mission_id,
            checkpoint.id,
            trigger.as_str(),
            checkpoint.progress_percent,
            checkpoint.sorties.len(),
            checkpoint.active_locks.len(),
            checkpoint.pending_messages.len()
        );

        let payload = EventPayload::CheckpointCreated(CheckpointCreatedData {
            checkpoint_id: checkpoint.id.clone(),
            mission_id: checkpoint.mission_id.clone(),
            trigger,
            progress_percent: checkpoint.progress_percent,
            created_by: checkpoint.created_by.clone(),
        });
        if let Err(err) = self
            .store
            .append(StreamType::Mission, &checkpoint.mission_id, payload)
        {
            log::warn!(
                "checkpoint_event_failed mission_id={} checkpoint_id={} error={}",
                checkpoint.mission_id,
                checkpoint.id,
                err
            );
        }
        Ok(checkpoint)
    }

    /// Non-blocking variant for callers driving mission work: failures are logged.
    pub fn try_create_checkpoint(
        &self,
        mission_id: &str,
        trigger: CheckpointTrigger,
        options: CheckpointOptions,
        now: DateTime<Utc>,
    ) -> Option<Checkpoint> {
        match self.create_checkpoint_at(mission_id, trigger, options, now) {
            Ok(checkpoint) => Some(checkpoint),
            Err(err) => {
                log::error!(
                    "checkpoint_failed mission_id={} trigger={} error={}",
                    mission_id,
                    trigger.as_str(),
                    err
                );
                None
            }
        }
    }
}

/// Feeds progress and error signals through the triggers into the creator.
///
/// Keeps one progress trigger and one error trigger per mission. A mission's
/// trigger stays locked from its gate check until the checkpoint is recorded,
/// so concurrent signals for one mission take at most one checkpoint. Every
/// entry point is non-blocking: failures are logged and yield `None`.
pub struct CheckpointCoordinator<S: FleetStore> {
    creator: CheckpointCreator<S>,
    progress_config: ProgressTriggerConfig,
    error_config: ErrorTriggerConfig,
    progress: Mutex<HashMap<String, Arc<Mutex<ProgressTrigger>>>>,
    errors: Mutex<HashMap<String, Arc<Mutex<ErrorTrigger>>>>,
}

impl<S: FleetStore> CheckpointCoordinator<S> {
    pub fn new(
        creator: CheckpointCreator<S>,
        progress_config: ProgressTriggerConfig,
        error_config: ErrorTriggerConfig,
    ) -> Self {
        Self {
            creator,
            progress_config,
            error_config,
            progress: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
        }
    }

    pub fn creator(&self) -> &CheckpointCreator<S> {
        &self.creator
    }

    pub fn on_progress(&self, mission_id: &str, progress: u8, created_by: &str) -> Option<Checkpoint> {
        self.on_progress_at(mission_id, progress, created_by, Utc::now())
    }

    pub fn on_progress_at(
        &self,
        mission_id: &str,
        progress: u8,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Option<Checkpoint> {
        let trigger = trigger_for(&self.progress, mission_id, || {
            ProgressTrigger::new(self.progress_config.clone())
        })?;
        let mut trigger = lock_trigger(&*trigger, "progress")?;
        if !trigger.should_checkpoint(progress, now) {
            return None;
        }
        let checkpoint = self.creator.try_create_checkpoint(
            mission_id,
            CheckpointTrigger::Progress,
            CheckpointOptions::new(created_by)
                .with_progress(progress)
                .with_details(format!("Progress reached {progress}%")),
            now,
        )?;
        trigger.record_checkpoint(progress, now);
        Some(checkpoint)
    }

    /// Files the blocker, then takes an error checkpoint if the mission's rate limit allows.
    pub fn on_error(
        &self,
        mission_id: &str,
        blocker: BlockerInfo,
        created_by: &str,
    ) -> Option<Checkpoint> {
        self.on_error_at(mission_id, blocker, created_by, Utc::now())
    }

    pub fn on_error_at(
        &self,
        mission_id: &str,
        blocker: BlockerInfo,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Option<Checkpoint> {
        let details = blocker.description.clone();
        let trigger = self.error_trigger(mission_id)?;
        let mut trigger = lock_trigger(&*trigger, "error")?;
        trigger.record_blocker(blocker);
        if !trigger.should_checkpoint(now) {
            return None;
        }
        let checkpoint = self.creator.try_create_checkpoint(
            mission_id,
            CheckpointTrigger::Error,
            CheckpointOptions::new(created_by)
                .with_details(details)
                .with_blockers(trigger.all_blockers()),
            now,
        )?;
        trigger.record_checkpoint(now);
        Some(checkpoint)
    }

    pub fn manual(
        &self,
        mission_id: &str,
        created_by: &str,
        details: Option<String>,
    ) -> Option<Checkpoint> {
        let mut options = CheckpointOptions::new(created_by);
        options.trigger_details = details;
        if let Some(blockers) = self.mission_blockers(mission_id) {
            options.blockers = blockers;
        }
        self.creator
            .try_create_checkpoint(mission_id, CheckpointTrigger::Manual, options, Utc::now())
    }

    /// Drops every blocker filed for the mission, e.g. after recovery.
    pub fn clear_blockers(&self, mission_id: &str) {
        if let Some(trigger) = self.error_trigger(mission_id) {
            if let Some(mut trigger) = lock_trigger(&*trigger, "error") {
                trigger.clear_all();
            }
        }
    }

    fn mission_blockers(&self, mission_id: &str) -> Option<Vec<BlockerInfo>> {
        let trigger = self.error_trigger(mission_id)?;
        let trigger = lock_trigger(&*trigger, "error")?;
        Some(trigger.all_blockers())
    }

    fn error_trigger(&self, mission_id: &str) -> Option<Arc<Mutex<ErrorTrigger>>> {
        trigger_for(&self.errors, mission_id, || {
            ErrorTrigger::new(self.error_config.clone())
        })
    }
}

fn trigger_for<T>(
    triggers: &Mutex<HashMap<String, Arc<Mutex<T>>>>,
    mission_id: &str,
    create: impl FnOnce() -> T,
) -> Option<Arc<Mutex<T>>> {
    match triggers.lock() {
        Ok(mut triggers) => Some(
            triggers
                .entry(mission_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(create())))
                .clone(),
        ),
        Err(_) => {
            log::error!("trigger registry lock poisoned mission_id={mission_id}");
            None
        }
    }
}

fn lock_trigger<'a, T>(trigger: &'a Mutex<T>, kind: &str) -> Option<MutexGuard<'a, T>> {
    match trigger.lock() {
        Ok(guard) => Some(guard),
        Err(_) => {
            log::error!("{kind} trigger lock poisoned");
            None
        }
    }
}
