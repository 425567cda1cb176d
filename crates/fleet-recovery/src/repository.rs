//! Collaborator interfaces the recovery engine reads and writes through.
//!
//! The live tables belong to the coordination layer; the engine never keeps
//! authoritative state in process memory. Every method is synchronous; a live
//! restore writes through the [RestoreTransaction] it opens instead.

use chrono::{DateTime, Utc};

use fleet_kernel::{Event, EventPayload, EventStore, KernelError, StreamType};

use crate::error::RecoveryError;
use crate::models::{
    Checkpoint, LockAcquisition, LockRequest, Lock, Message, MessageSnapshot, Mission,
    MissionStatus, Sortie,
};

/// Restore claims older than this are treated as abandoned by a crashed restorer.
pub const RESTORE_CLAIM_STALE_MS: i64 = 10 * 60 * 1000;

pub trait MissionRepository: Send + Sync {
    fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>, RecoveryError>;

    fn missions_by_status(&self, status: MissionStatus) -> Result<Vec<Mission>, RecoveryError>;

    /// Fails with `NotFound` when the mission does not exist.
    fn update_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
    ) -> Result<(), RecoveryError>;
}

pub trait SortieRepository: Send + Sync {
    fn get_sortie(&self, sortie_id: &str) -> Result<Option<Sortie>, RecoveryError>;

    fn sorties_by_mission(&self, mission_id: &str) -> Result<Vec<Sortie>, RecoveryError>;

    /// Writes the sortie wholesale, inserting it when absent.
    fn update_sortie(&self, sortie: &Sortie) -> Result<(), RecoveryError>;
}

/// File locks. At most one unreleased lock exists per file.
///
/// `acquire_lock` treats an expired holder as free (releasing it) and a request
/// from the current holder as a refresh.
pub trait LockRepository: Send + Sync {
    fn acquire_lock(
        &self,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition, RecoveryError>;

    fn force_release_lock(&self, lock_id: &str, now: DateTime<Utc>) -> Result<(), RecoveryError>;

    /// Unreleased locks tagged with the mission, expired or not.
    fn active_locks_for_mission(&self, mission_id: &str) -> Result<Vec<Lock>, RecoveryError>;

    fn active_lock_for_file(&self, file: &str) -> Result<Option<Lock>, RecoveryError>;
}

pub trait MessageRepository: Send + Sync {
    /// Undelivered messages of the mission, oldest first.
    fn pending_messages(&self, mission_id: &str) -> Result<Vec<Message>, RecoveryError>;

    /// Puts the message back on the queue as undelivered, recreating it if it was purged.
    fn requeue_message(
        &self,
        mission_id: &str,
        message: &MessageSnapshot,
    ) -> Result<(), RecoveryError>;
}

pub trait CheckpointRepository: Send + Sync {
    fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RecoveryError>;

    fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, RecoveryError>;

    /// Newest checkpoint of the mission that has not been consumed.
    fn latest_checkpoint_for_mission(
        &self,
        mission_id: &str,
    ) -> Result<Option<Checkpoint>, RecoveryError>;

    /// Sets `consumed`. Returns false when it was already set.
    fn mark_checkpoint_consumed(&self, checkpoint_id: &str) -> Result<bool, RecoveryError>;

    /// All checkpoints, oldest first.
    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, RecoveryError>;

    /// Returns false when nothing was deleted.
    fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool, RecoveryError>;
}

/// Writes of one live restore, applied atomically.
///
/// Only writes made through the transaction join it; whatever other callers
/// write through the store meanwhile survives its rollback. Dropping an
/// unfinished transaction rolls it back.
pub trait RestoreTransaction {
    fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>, RecoveryError>;

    fn update_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
    ) -> Result<(), RecoveryError>;

    fn get_sortie(&self, sortie_id: &str) -> Result<Option<Sortie>, RecoveryError>;

    fn update_sortie(&self, sortie: &Sortie) -> Result<(), RecoveryError>;

    fn acquire_lock(
        &self,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition, RecoveryError>;

    fn force_release_lock(&self, lock_id: &str, now: DateTime<Utc>) -> Result<(), RecoveryError>;

    fn requeue_message(
        &self,
        mission_id: &str,
        message: &MessageSnapshot,
    ) -> Result<(), RecoveryError>;

    fn mark_checkpoint_consumed(&self, checkpoint_id: &str) -> Result<bool, RecoveryError>;

    fn append_event(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        payload: EventPayload,
    ) -> Result<Event, KernelError>;

    /// On failure nothing is applied.
    fn commit(self: Box<Self>) -> Result<(), RecoveryError>;

    /// The transaction is closed even when this returns an error.
    fn rollback(self: Box<Self>) -> Result<(), RecoveryError>;
}

/// Opens restore transactions. Transactions of different missions may be open
/// at the same time; the store serializes their writes.
pub trait TransactionControl: Send + Sync {
    fn begin_restore(&self) -> Result<Box<dyn RestoreTransaction + '_>, RecoveryError>;
}

/// Per-mission advisory lock serializing live restores across processes.
pub trait RestoreClaimRepository: Send + Sync {
    /// Takes the claim unless another owner holds a claim younger than
    /// [RESTORE_CLAIM_STALE_MS]. Returns whether the claim was taken.
    fn try_claim_restore(
        &self,
        mission_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RecoveryError>;

    fn release_restore(&self, mission_id: &str, owner: &str) -> Result<(), RecoveryError>;
}

/// Everything the recovery services need from one backing store.
pub trait FleetStore:
    MissionRepository
    + SortieRepository
    + LockRepository
    + MessageRepository
    + CheckpointRepository
    + TransactionControl
    + RestoreClaimRepository
    + EventStore
{
}

impl<T> FleetStore for T where
    T: MissionRepository
        + SortieRepository
        + LockRepository
        + MessageRepository
        + CheckpointRepository
        + TransactionControl
        + RestoreClaimRepository
        + EventStore
{
}
