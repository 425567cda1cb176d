//! State restore: checkpoint → live sorties, locks and messages.
//!
//! A live restore runs under the mission's restore claim and one store
//! transaction. Per-item failures are collected into the result; anything else
//! rolls the whole transaction back. A dry run reads only and reports the same
//! counts a live restore would produce.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use fleet_kernel::{EventPayload, FleetRecoveredData, LockReleasedData, Seq, StreamType};

use crate::error::RecoveryError;
use crate::models::{
    BlockerInfo, BlockerType, Checkpoint, Lock, LockAcquisition, LockSnapshot, MissionStatus,
    RecoveryContext,
};
use crate::narrative::with_restore_blockers;
use crate::repository::{FleetStore, RestoreTransaction};

/// Phases of a live restore, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestorePhase {
    Sorties,
    Locks,
    Messages,
    /// Mission status, checkpoint consumption and the `fleet_recovered` event.
    Finalize,
}

impl RestorePhase {
    pub fn pipeline() -> &'static [RestorePhase] {
        &[
            RestorePhase::Sorties,
            RestorePhase::Locks,
            RestorePhase::Messages,
            RestorePhase::Finalize,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestorePhase::Sorties => "sorties",
            RestorePhase::Locks => "locks",
            RestorePhase::Messages => "messages",
            RestorePhase::Finalize => "finalize",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub dry_run: bool,
    /// Take conflicting locks away from their current holder.
    pub force_locks: bool,
}

impl RestoreOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            force_locks: false,
        }
    }

    pub fn force_locks() -> Self {
        Self {
            dry_run: false,
            force_locks: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RestoredCounts {
    pub sorties: u32,
    pub locks: u32,
    pub messages: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum RollbackOutcome {
    NotNeeded,
    RolledBack,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub checkpoint_id: Option<String>,
    pub mission_id: Option<String>,
    pub dry_run: bool,
    pub restored: RestoredCounts,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub recovery_context: Option<RecoveryContext>,
    pub rollback: RollbackOutcome,
    /// Sequence of the appended `fleet_recovered` event.
    pub event_sequence: Option<Seq>,
}

impl RecoveryResult {
    fn failure(
        checkpoint_id: Option<&str>,
        mission_id: Option<&str>,
        dry_run: bool,
        error: String,
    ) -> Self {
        Self {
            success: false,
            checkpoint_id: checkpoint_id.map(str::to_string),
            mission_id: mission_id.map(str::to_string),
            dry_run,
            restored: RestoredCounts::default(),
            warnings: Vec::new(),
            errors: vec![error],
            recovery_context: None,
            rollback: RollbackOutcome::NotNeeded,
            event_sequence: None,
        }
    }
}

/// `error_code` of blockers filed for locks another holder kept.
pub const LOCK_CONFLICT_CODE: &str = "lock_conflict";

/// Accumulates what the phases report.
#[derive(Default)]
struct RestoreLedger {
    restored: RestoredCounts,
    warnings: Vec<String>,
    errors: Vec<String>,
    blockers: Vec<BlockerInfo>,
}

impl RestoreLedger {
    fn expired_lock(&mut self, snapshot: &LockSnapshot, now: DateTime<Utc>) {
        let err = RecoveryError::Expired {
            file: snapshot.file.clone(),
            age_ms: snapshot.age_ms(now),
            timeout_ms: snapshot.timeout_ms,
        };
        self.warnings.push(format!("skipped lock: {err}"));
        self.blockers.push(
            BlockerInfo::new(
                BlockerType::LockTimeout,
                format!("Lock on {} expired before restore", snapshot.file),
                now,
            )
            .with_hint(format!(
                "Re-acquire {} before editing it",
                snapshot.file
            )),
        );
    }

    fn lock_conflict(&mut self, snapshot: &LockSnapshot, holder: &Lock, now: DateTime<Utc>) {
        let err = RecoveryError::Conflict {
            file: snapshot.file.clone(),
            held_by: holder.held_by.clone(),
        };
        self.warnings.push(format!("skipped lock: {err}"));
        self.blockers.push(
            BlockerInfo::new(
                BlockerType::Dependency,
                format!(
                    "Lock conflict: {} is held by {}",
                    snapshot.file, holder.held_by
                ),
                now,
            )
            .with_error_code(LOCK_CONFLICT_CODE)
            .with_hint(format!(
                "Wait for {} to release {} or restore with force_locks",
                holder.held_by, snapshot.file
            )),
        );
    }
}

/// Applies checkpoints to live state.
pub struct StateRestorer<S: FleetStore> {
    store: S,
    owner: String,
}

impl<S: FleetStore> StateRestorer<S> {
    pub fn new(store: S) -> Self {
        Self::with_owner(store, format!("restorer-{}", Uuid::new_v4()))
    }

    /// `owner` identifies this process in restore claims.
    pub fn with_owner(store: S, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn restore_from_checkpoint(
        &self,
        checkpoint_id: &str,
        options: RestoreOptions,
    ) -> Result<RecoveryResult, RecoveryError> {
        self.restore_from_checkpoint_at(checkpoint_id, options, Utc::now())
    }

    pub fn restore_from_checkpoint_at(
        &self,
        checkpoint_id: &str,
        options: RestoreOptions,
        now: DateTime<Utc>,
    ) -> Result<RecoveryResult, RecoveryError> {
        match self.store.get_checkpoint(checkpoint_id)? {
            Some(checkpoint) => self.restore(checkpoint, options, now),
            None => Ok(RecoveryResult::failure(
                Some(checkpoint_id),
                None,
                options.dry_run,
                RecoveryError::not_found("checkpoint", checkpoint_id).to_string(),
            )),
        }
    }

    pub fn restore_latest(
        &self,
        mission_id: &str,
        options: RestoreOptions,
    ) -> Result<RecoveryResult, RecoveryError> {
        self.restore_latest_at(mission_id, options, Utc::now())
    }

    pub fn restore_latest_at(
        &self,
        mission_id: &str,
        options: RestoreOptions,
        now: DateTime<Utc>,
    ) -> Result<RecoveryResult, RecoveryError> {
        match self.store.latest_checkpoint_for_mission(mission_id)? {
            Some(checkpoint) => self.restore(checkpoint, options, now),
            None => Ok(RecoveryResult::failure(
                None,
                Some(mission_id),
                options.dry_run,
                format!("no unconsumed checkpoint for mission {mission_id}"),
            )),
        }
    }

    fn restore(
        &self,
        checkpoint: Checkpoint,
        options: RestoreOptions,
        now: DateTime<Utc>,
    ) -> Result<RecoveryResult, RecoveryError> {
        if checkpoint.consumed {
            return Ok(RecoveryResult::failure(
                Some(checkpoint.id.as_str()),
                Some(checkpoint.mission_id.as_str()),
                options.dry_run,
                format!("checkpoint {} was already consumed", checkpoint.id),
            ));
        }
        if options.dry_run {
            return self.preview(&checkpoint, options, now);
        }
        if !self
            .store
            .try_claim_restore(&checkpoint.mission_id, &self.owner, now)?
        {
            log::warn!(
                "restore_rejected mission_id={} checkpoint_id={} reason=claim_held",
                checkpoint.mission_id,
                checkpoint.id
            );
            return Ok(RecoveryResult::failure(
                Some(checkpoint.id.as_str()),
                Some(checkpoint.mission_id.as_str()),
                false,
                format!(
                    "restore already in progress for mission {}",
                    checkpoint.mission_id
                ),
            ));
        }
        let result = self.restore_claimed(&checkpoint, options, now);
        if let Err(err) = self
            .store
            .release_restore(&checkpoint.mission_id, &self.owner)
        {
            log::warn!(
                "restore_claim_release_failed mission_id={} error={}",
                checkpoint.mission_id,
                err
            );
        }
        Ok(result)
    }

    fn restore_claimed(
        &self,
        checkpoint: &Checkpoint,
        options: RestoreOptions,
        now: DateTime<Utc>,
    ) -> RecoveryResult {
        let tx = match self.store.begin_restore() {
            Ok(tx) => tx,
            Err(err) => {
                log::error!(
                    "restore_begin_failed mission_id={} checkpoint_id={} error={}",
                    checkpoint.mission_id,
                    checkpoint.id,
                    err
                );
                return RecoveryResult::failure(
                    Some(checkpoint.id.as_str()),
                    Some(checkpoint.mission_id.as_str()),
                    false,
                    format!("could not begin restore: {err}"),
                );
            }
        };

        let mut ledger = RestoreLedger::default();
        let applied = apply(tx.as_ref(), checkpoint, options, now, &mut ledger);
        let outcome = match applied {
            Ok(sequence) => tx
                .commit()
                .map(|()| sequence)
                .map_err(|err| (RestorePhase::Finalize, err, RollbackOutcome::RolledBack)),
            Err((phase, err)) => {
                let rollback = match tx.rollback() {
                    Ok(()) => RollbackOutcome::RolledBack,
                    Err(rollback_err) => RollbackOutcome::Failed(rollback_err.to_string()),
                };
                Err((phase, err, rollback))
            }
        };

        match outcome {
            Ok(event_sequence) => {
                let success = ledger.errors.is_empty();
                log::info!(
                    "fleet_restore mission_id={} checkpoint_id={} success={} sorties={} locks={} messages={} warnings={} errors={}",
                    checkpoint.mission_id,
                    checkpoint.id,
                    success,
                    ledger.restored.sorties,
                    ledger.restored.locks,
                    ledger.restored.messages,
                    ledger.warnings.len(),
                    ledger.errors.len()
                );
                RecoveryResult {
                    success,
                    checkpoint_id: Some(checkpoint.id.clone()),
                    mission_id: Some(checkpoint.mission_id.clone()),
                    dry_run: false,
                    restored: ledger.restored,
                    warnings: ledger.warnings,
                    errors: ledger.errors,
                    recovery_context: Some(with_restore_blockers(
                        checkpoint.recovery_context.clone(),
                        ledger.blockers,
                    )),
                    rollback: RollbackOutcome::NotNeeded,
                    event_sequence,
                }
            }
            Err((phase, err, rollback)) => {
                log::error!(
                    "restore_rolled_back mission_id={} checkpoint_id={} phase={} error={} rollback={:?}",
                    checkpoint.mission_id,
                    checkpoint.id,
                    phase.as_str(),
                    err,
                    rollback
                );
                let mut errors = ledger.errors;
                errors.push(format!("restore aborted during {}: {err}", phase.as_str()));
                if let RollbackOutcome::Failed(rollback_err) = &rollback {
                    errors.push(format!("rollback failed: {rollback_err}"));
                }
                RecoveryResult {
                    success: false,
                    checkpoint_id: Some(checkpoint.id.clone()),
                    mission_id: Some(checkpoint.mission_id.clone()),
                    dry_run: false,
                    restored: RestoredCounts::default(),
                    warnings: ledger.warnings,
                    errors,
                    recovery_context: None,
                    rollback,
                    event_sequence: None,
                }
            }
        }
    }

    /// Read-only mirror of the live phases.
    fn preview(
        &self,
        checkpoint: &Checkpoint,
        options: RestoreOptions,
        now: DateTime<Utc>,
    ) -> Result<RecoveryResult, RecoveryError> {
        let mut ledger = RestoreLedger::default();
        ledger.restored.sorties = checkpoint.sorties.len() as u32;
        for snapshot in &checkpoint.active_locks {
            if snapshot.is_expired(now) {
                ledger.expired_lock(snapshot, now);
                continue;
            }
            match self.store.active_lock_for_file(&snapshot.file)? {
                Some(holder) if holder.held_by != snapshot.held_by && !holder.is_expired(now) => {
                    if options.force_locks {
                        ledger.warnings.push(format!(
                            "would force release of lock on {} held by {}",
                            holder.file, holder.held_by
                        ));
                        ledger.restored.locks += 1;
                    } else {
                        ledger.lock_conflict(snapshot, &holder, now);
                    }
                }
                _ => ledger.restored.locks += 1,
            }
        }
        ledger.restored.messages = checkpoint
            .pending_messages
            .iter()
            .filter(|m| !m.delivered)
            .count() as u32;

        log::info!(
            "fleet_restore_preview mission_id={} checkpoint_id={} sorties={} locks={} messages={} warnings={}",
            checkpoint.mission_id,
            checkpoint.id,
            ledger.restored.sorties,
            ledger.restored.locks,
            ledger.restored.messages,
            ledger.warnings.len()
        );
        Ok(RecoveryResult {
            success: true,
            checkpoint_id: Some(checkpoint.id.clone()),
            mission_id: Some(checkpoint.mission_id.clone()),
            dry_run: true,
            restored: ledger.restored,
            warnings: ledger.warnings,
            errors: Vec::new(),
            recovery_context: Some(with_restore_blockers(
                checkpoint.recovery_context.clone(),
                ledger.blockers,
            )),
            rollback: RollbackOutcome::NotNeeded,
            event_sequence: None,
        })
    }
}

/// Runs every phase inside the open transaction. `Err` means roll back.
fn apply(
    tx: &dyn RestoreTransaction,
    checkpoint: &Checkpoint,
    options: RestoreOptions,
    now: DateTime<Utc>,
    ledger: &mut RestoreLedger,
) -> Result<Option<Seq>, (RestorePhase, RecoveryError)> {
    for phase in RestorePhase::pipeline() {
        let step = match phase {
            RestorePhase::Sorties => restore_sorties(tx, checkpoint, ledger),
            RestorePhase::Locks => restore_locks(tx, checkpoint, options, now, ledger),
            RestorePhase::Messages => requeue_messages(tx, checkpoint, ledger),
            RestorePhase::Finalize => {
                return finalize(tx, checkpoint, now, ledger)
                    .map_err(|err| (*phase, err));
            }
        };
        step.map_err(|err| (*phase, err))?;
    }
    Ok(None)
}

fn restore_sorties(
    tx: &dyn RestoreTransaction,
    checkpoint: &Checkpoint,
    ledger: &mut RestoreLedger,
) -> Result<(), RecoveryError> {
    for snapshot in &checkpoint.sorties {
        let written = tx
            .get_sortie(&snapshot.id)
            .map(|live| snapshot.apply_to(&checkpoint.mission_id, live))
            .and_then(|sortie| tx.update_sortie(&sortie));
        match written {
            Ok(()) => ledger.restored.sorties += 1,
            Err(err) => ledger.errors.push(format!("sortie {}: {err}", snapshot.id)),
        }
    }
    Ok(())
}

fn restore_locks(
    tx: &dyn RestoreTransaction,
    checkpoint: &Checkpoint,
    options: RestoreOptions,
    now: DateTime<Utc>,
    ledger: &mut RestoreLedger,
) -> Result<(), RecoveryError> {
    for snapshot in &checkpoint.active_locks {
        if snapshot.is_expired(now) {
            ledger.expired_lock(snapshot, now);
            continue;
        }
        let request = snapshot.reacquire_request(&checkpoint.mission_id);
        let holder = match tx.acquire_lock(&request, now) {
            Ok(LockAcquisition::Acquired(_)) => {
                ledger.restored.locks += 1;
                continue;
            }
            Ok(LockAcquisition::Conflict(holder)) => holder,
            Err(err) => {
                ledger.errors.push(format!("lock {}: {err}", snapshot.file));
                continue;
            }
        };
        if !options.force_locks {
            ledger.lock_conflict(snapshot, &holder, now);
            continue;
        }

        if let Err(err) = tx.force_release_lock(&holder.id, now) {
            ledger.errors.push(format!("lock {}: {err}", snapshot.file));
            continue;
        }
        tx.append_event(
            StreamType::Lock,
            &holder.file,
            EventPayload::LockReleased(LockReleasedData {
                lock_id: holder.id.clone(),
                file: holder.file.clone(),
                held_by: holder.held_by.clone(),
                forced: true,
            }),
        )?;
        ledger.warnings.push(format!(
            "forced release of lock on {} held by {}",
            holder.file, holder.held_by
        ));
        match tx.acquire_lock(&request, now) {
            Ok(LockAcquisition::Acquired(_)) => ledger.restored.locks += 1,
            Ok(LockAcquisition::Conflict(other)) => ledger.lock_conflict(snapshot, &other, now),
            Err(err) => ledger.errors.push(format!("lock {}: {err}", snapshot.file)),
        }
    }
    Ok(())
}

fn requeue_messages(
    tx: &dyn RestoreTransaction,
    checkpoint: &Checkpoint,
    ledger: &mut RestoreLedger,
) -> Result<(), RecoveryError> {
    for snapshot in checkpoint.pending_messages.iter().filter(|m| !m.delivered) {
        match tx.requeue_message(&checkpoint.mission_id, snapshot) {
            Ok(()) => ledger.restored.messages += 1,
            Err(err) => ledger.errors.push(format!("message {}: {err}", snapshot.id)),
        }
    }
    Ok(())
}

/// Skipped when any item failed, leaving the checkpoint available for another attempt.
fn finalize(
    tx: &dyn RestoreTransaction,
    checkpoint: &Checkpoint,
    now: DateTime<Utc>,
    ledger: &mut RestoreLedger,
) -> Result<Option<Seq>, RecoveryError> {
    if !ledger.errors.is_empty() {
        return Ok(None);
    }
    match tx.get_mission(&checkpoint.mission_id)? {
        Some(mission) if !mission.status.is_terminal() => {
            if mission.status != MissionStatus::InProgress {
                tx.update_mission_status(&mission.id, MissionStatus::InProgress)?;
            }
        }
        Some(_) => {}
        None => {
            ledger.errors.push(
                RecoveryError::not_found("mission", checkpoint.mission_id.clone()).to_string(),
            );
            return Ok(None);
        }
    }
    if !tx.mark_checkpoint_consumed(&checkpoint.id)? {
        return Err(RecoveryError::Transaction(format!(
            "checkpoint {} was consumed by a concurrent restore",
            checkpoint.id
        )));
    }
    let event = tx.append_event(
        StreamType::Mission,
        &checkpoint.mission_id,
        EventPayload::FleetRecovered(FleetRecoveredData {
            checkpoint_id: checkpoint.id.clone(),
            restored_at: now,
            sorties_restored: ledger.restored.sorties,
            locks_restored: ledger.restored.locks,
            messages_requeued: ledger.restored.messages,
            warnings: ledger.warnings.len() as u32,
        }),
    )?;
    Ok(Some(event.sequence))
}

/// Markdown briefing handed to a resumed specialist.
pub fn format_recovery_prompt(result: &RecoveryResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Mission Recovery");
    let _ = writeln!(out);
    let mission = result.mission_id.as_deref().unwrap_or("unknown");
    let checkpoint = result.checkpoint_id.as_deref().unwrap_or("none");
    let status = match (result.success, result.dry_run) {
        (true, true) => "Preview only, nothing was changed",
        (true, false) => "Restored",
        (false, _) => "Recovery failed",
    };
    let _ = writeln!(out, "{status}: mission `{mission}`, checkpoint `{checkpoint}`.");

    if let Some(ctx) = &result.recovery_context {
        let _ = writeln!(out, "\n## Summary\n{}", ctx.mission_summary);
        let _ = writeln!(out, "\n## Last Action\n{}", ctx.last_action);
        let _ = writeln!(
            out,
            "\nLast activity at {}, {} min into the mission.",
            ctx.last_activity_at.to_rfc3339(),
            ctx.elapsed_time_ms / 60_000
        );
    }

    let _ = writeln!(out, "\n## Restored");
    let _ = writeln!(out, "- Sorties: {}", result.restored.sorties);
    let _ = writeln!(out, "- Locks: {}", result.restored.locks);
    let _ = writeln!(out, "- Messages requeued: {}", result.restored.messages);

    if let Some(ctx) = &result.recovery_context {
        if !ctx.next_steps.is_empty() {
            let _ = writeln!(out, "\n## Next Steps");
            for (i, step) in ctx.next_steps.iter().enumerate() {
                let _ = writeln!(out, "{}. {}", i + 1, step);
            }
        }
        if !ctx.blockers.is_empty() {
            let _ = writeln!(out, "\n## Blockers");
            for blocker in &ctx.blockers {
                let _ = write!(out, "- [{}] {}", blocker.blocker_type.as_str(), blocker.description);
                if let Some(sortie) = &blocker.affected_sortie {
                    let _ = write!(out, " (sortie {sortie})");
                }
                if let Some(hint) = &blocker.resolution_hint {
                    let _ = write!(out, ". Hint: {hint}");
                }
                let _ = writeln!(out);
            }
        }
        if !ctx.files_modified.is_empty() {
            let _ = writeln!(out, "\n## Files Modified");
            for file in &ctx.files_modified {
                let _ = writeln!(out, "- {file}");
            }
        }
    }

    if !result.warnings.is_empty() {
        let _ = writeln!(out, "\n## Warnings");
        for warning in &result.warnings {
            let _ = writeln!(out, "- {warning}");
        }
    }
    if !result.errors.is_empty() {
        let _ = writeln!(out, "\n## Errors");
        for error in &result.errors {
            let _ = writeln!(out, "- {error}");
        }
    }
    out
}
