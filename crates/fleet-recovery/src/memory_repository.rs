//! In-memory fleet store implementing every collaborator interface.
//!
//! All tables and the event log live in one guarded [FleetState]. A restore
//! transaction writes rows in place and journals their prior values, so a
//! rollback reverts exactly the rows it wrote. Its events are staged and only
//! appended on commit.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use fleet_kernel::{
    apply_query, build_event, next_sequence, validate_stream_id, Event, EventPayload,
    EventQuery, EventStore, KernelError, StreamId, StreamType,
};

use crate::error::RecoveryError;
use crate::models::{
    Checkpoint, Lock, LockAcquisition, LockRequest, Message, MessageSnapshot, Mission,
    MissionStatus, Sortie,
};
use crate::repository::{
    CheckpointRepository, LockRepository, MessageRepository, MissionRepository,
    RestoreClaimRepository, RestoreTransaction, SortieRepository, TransactionControl,
    RESTORE_CLAIM_STALE_MS,
};

#[derive(Debug, Default)]
struct FleetState {
    missions: BTreeMap<String, Mission>,
    sorties: BTreeMap<String, Sortie>,
    locks: Vec<Lock>,
    messages: BTreeMap<String, Message>,
    checkpoints: BTreeMap<String, Checkpoint>,
    events: HashMap<StreamId, Vec<Event>>,
}

#[derive(Clone, Debug)]
struct RestoreClaim {
    owner: String,
    claimed_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    state: FleetState,
    claims: HashMap<String, RestoreClaim>,
}

/// Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct InMemoryFleetStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, RecoveryError> {
        self.inner
            .lock()
            .map_err(|_| RecoveryError::Store("in-memory fleet store lock poisoned".to_string()))
    }

    fn lock_kernel(&self) -> Result<MutexGuard<'_, Inner>, KernelError> {
        self.inner
            .lock()
            .map_err(|_| KernelError::EventStore("in-memory fleet store lock poisoned".to_string()))
    }

    /// Inserts or replaces a mission row.
    pub fn insert_mission(&self, mission: Mission) -> Result<(), RecoveryError> {
        let mut inner = self.lock()?;
        inner.state.missions.insert(mission.id.clone(), mission);
        Ok(())
    }

    /// Inserts or replaces a sortie row.
    pub fn insert_sortie(&self, sortie: Sortie) -> Result<(), RecoveryError> {
        self.update_sortie(&sortie)
    }

    pub fn send_message(&self, message: Message) -> Result<(), RecoveryError> {
        let mut inner = self.lock()?;
        inner.state.messages.insert(message.id.clone(), message);
        Ok(())
    }

    /// Marks a message delivered. Returns false when it does not exist.
    pub fn ack_message(&self, message_id: &str) -> Result<bool, RecoveryError> {
        let mut inner = self.lock()?;
        Ok(match inner.state.messages.get_mut(message_id) {
            Some(message) => {
                message.delivered = true;
                true
            }
            None => false,
        })
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>, RecoveryError> {
        Ok(self.lock()?.state.messages.get(message_id).cloned())
    }

    pub fn release_lock(&self, lock_id: &str, now: DateTime<Utc>) -> Result<bool, RecoveryError> {
        let mut inner = self.lock()?;
        Ok(release_in(&mut inner.state.locks, lock_id, now))
    }

    /// Every lock row ever written, released ones included.
    pub fn all_locks(&self) -> Result<Vec<Lock>, RecoveryError> {
        Ok(self.lock()?.state.locks.clone())
    }
}

fn release_in(locks: &mut [Lock], lock_id: &str, now: DateTime<Utc>) -> bool {
    match locks
        .iter_mut()
        .find(|l| l.id == lock_id && l.released_at.is_none())
    {
        Some(lock) => {
            lock.released_at = Some(now);
            true
        }
        None => false,
    }
}

fn acquire_in(locks: &mut Vec<Lock>, request: &LockRequest, now: DateTime<Utc>) -> LockAcquisition {
    if let Some(existing) = locks
        .iter_mut()
        .find(|l| l.file == request.file && l.released_at.is_none())
    {
        if existing.is_expired(now) {
            existing.released_at = Some(now);
        } else if existing.held_by == request.held_by {
            existing.acquired_at = now;
            existing.timeout_ms = request.timeout_ms;
            existing.purpose = request.purpose.clone();
            return LockAcquisition::Acquired(existing.clone());
        } else {
            return LockAcquisition::Conflict(existing.clone());
        }
    }
    let lock = Lock {
        id: format!("lock-{}", Uuid::new_v4()),
        file: request.file.clone(),
        held_by: request.held_by.clone(),
        mission_id: request.mission_id.clone(),
        acquired_at: now,
        purpose: request.purpose.clone(),
        timeout_ms: request.timeout_ms,
        released_at: None,
    };
    locks.push(lock.clone());
    LockAcquisition::Acquired(lock)
}

fn set_mission_status(
    missions: &mut BTreeMap<String, Mission>,
    mission_id: &str,
    status: MissionStatus,
) -> Result<(), RecoveryError> {
    let mission = missions
        .get_mut(mission_id)
        .ok_or_else(|| RecoveryError::not_found("mission", mission_id))?;
    mission.status = status;
    if status == MissionStatus::InProgress && mission.started_at.is_none() {
        mission.started_at = Some(Utc::now());
    }
    Ok(())
}

fn consume_in(
    checkpoints: &mut BTreeMap<String, Checkpoint>,
    checkpoint_id: &str,
) -> Result<bool, RecoveryError> {
    let checkpoint = checkpoints
        .get_mut(checkpoint_id)
        .ok_or_else(|| RecoveryError::not_found("checkpoint", checkpoint_id))?;
    if checkpoint.consumed {
        return Ok(false);
    }
    checkpoint.consumed = true;
    Ok(true)
}

impl MissionRepository for InMemoryFleetStore {
    fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>, RecoveryError> {
        Ok(self.lock()?.state.missions.get(mission_id).cloned())
    }

    fn missions_by_status(&self, status: MissionStatus) -> Result<Vec<Mission>, RecoveryError> {
        Ok(self
            .lock()?
            .state
            .missions
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect())
    }

    fn update_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
    ) -> Result<(), RecoveryError> {
        let mut inner = self.lock()?;
        set_mission_status(&mut inner.state.missions, mission_id, status)
    }
}

impl SortieRepository for InMemoryFleetStore {
    fn get_sortie(&self, sortie_id: &str) -> Result<Option<Sortie>, RecoveryError> {
        Ok(self.lock()?.state.sorties.get(sortie_id).cloned())
    }

    fn sorties_by_mission(&self, mission_id: &str) -> Result<Vec<Sortie>, RecoveryError> {
        Ok(self
            .lock()?
            .state
            .sorties
            .values()
            .filter(|s| s.mission_id == mission_id)
            .cloned()
            .collect())
    }

    fn update_sortie(&self, sortie: &Sortie) -> Result<(), RecoveryError> {
        let mut inner = self.lock()?;
        inner.state.sorties.insert(sortie.id.clone(), sortie.clone());
        Ok(())
    }
}

impl LockRepository for InMemoryFleetStore {
    fn acquire_lock(
        &self,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition, RecoveryError> {
        let mut inner = self.lock()?;
        Ok(acquire_in(&mut inner.state.locks, request, now))
    }

    fn force_release_lock(&self, lock_id: &str, now: DateTime<Utc>) -> Result<(), RecoveryError> {
        let mut inner = self.lock()?;
        if release_in(&mut inner.state.locks, lock_id, now) {
            Ok(())
        } else {
            Err(RecoveryError::not_found("lock", lock_id))
        }
    }

    fn active_locks_for_mission(&self, mission_id: &str) -> Result<Vec<Lock>, RecoveryError> {
        Ok(self
            .lock()?
            .state
            .locks
            .iter()
            .filter(|l| l.released_at.is_none() && l.mission_id.as_deref() == Some(mission_id))
            .cloned()
            .collect())
    }

    fn active_lock_for_file(&self, file: &str) -> Result<Option<Lock>, RecoveryError> {
        Ok(self
            .lock()?
            .state
            .locks
            .iter()
            .find(|l| l.released_at.is_none() && l.file == file)
            .cloned())
    }
}

impl MessageRepository for InMemoryFleetStore {
    fn pending_messages(&self, mission_id: &str) -> Result<Vec<Message>, RecoveryError> {
        let mut pending: Vec<Message> = self
            .lock()?
            .state
            .messages
            .values()
            .filter(|m| m.mission_id == mission_id && !m.delivered)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.sent_at);
        Ok(pending)
    }

    fn requeue_message(
        &self,
        mission_id: &str,
        message: &MessageSnapshot,
    ) -> Result<(), RecoveryError> {
        let mut inner = self.lock()?;
        inner
            .state
            .messages
            .insert(message.id.clone(), message.to_pending(mission_id));
        Ok(())
    }
}

impl CheckpointRepository for InMemoryFleetStore {
    fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RecoveryError> {
        let mut inner = self.lock()?;
        if inner.state.checkpoints.contains_key(&checkpoint.id) {
            return Err(RecoveryError::Validation(format!(
                "checkpoint already exists: {}",
                checkpoint.id
            )));
        }
        inner
            .state
            .checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, RecoveryError> {
        Ok(self.lock()?.state.checkpoints.get(checkpoint_id).cloned())
    }

    fn latest_checkpoint_for_mission(
        &self,
        mission_id: &str,
    ) -> Result<Option<Checkpoint>, RecoveryError> {
        Ok(self
            .lock()?
            .state
            .checkpoints
            .values()
            .filter(|c| c.mission_id == mission_id && !c.consumed)
            .max_by_key(|c| c.timestamp)
            .cloned())
    }

    fn mark_checkpoint_consumed(&self, checkpoint_id: &str) -> Result<bool, RecoveryError> {
        let mut inner = self.lock()?;
        consume_in(&mut inner.state.checkpoints, checkpoint_id)
    }

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, RecoveryError> {
        let mut all: Vec<Checkpoint> = self.lock()?.state.checkpoints.values().cloned().collect();
        all.sort_by_key(|c| c.timestamp);
        Ok(all)
    }

    fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool, RecoveryError> {
        Ok(self
            .lock()?
            .state
            .checkpoints
            .remove(checkpoint_id)
            .is_some())
    }
}

/// Prior value of a row a restore transaction wrote; `None` means it was inserted.
enum Undo {
    Mission(String, Option<Mission>),
    Sortie(String, Option<Sortie>),
    Lock(String, Option<Lock>),
    Message(String, Option<Message>),
    Checkpoint(String, Option<Checkpoint>),
}

#[derive(Default)]
struct Journal {
    undo: Vec<Undo>,
    staged_events: Vec<Event>,
}

fn restore_row<T>(table: &mut BTreeMap<String, T>, id: String, prior: Option<T>) {
    match prior {
        Some(row) => {
            table.insert(id, row);
        }
        None => {
            table.remove(&id);
        }
    }
}

fn undo_all(state: &mut FleetState, undo: Vec<Undo>) {
    for entry in undo.into_iter().rev() {
        match entry {
            Undo::Mission(id, prior) => restore_row(&mut state.missions, id, prior),
            Undo::Sortie(id, prior) => restore_row(&mut state.sorties, id, prior),
            Undo::Message(id, prior) => restore_row(&mut state.messages, id, prior),
            Undo::Checkpoint(id, prior) => restore_row(&mut state.checkpoints, id, prior),
            Undo::Lock(id, prior) => {
                let position = state.locks.iter().position(|l| l.id == id);
                match (position, prior) {
                    (Some(pos), Some(prior)) => state.locks[pos] = prior,
                    (Some(pos), None) => {
                        state.locks.remove(pos);
                    }
                    (None, Some(prior)) => state.locks.push(prior),
                    (None, None) => {}
                }
            }
        }
    }
}

fn committed_next_sequence(events: &HashMap<StreamId, Vec<Event>>, stream_id: &str) -> u64 {
    events
        .get(stream_id)
        .map(|log| next_sequence(log))
        .unwrap_or(1)
}

struct MemoryRestoreTransaction<'a> {
    store: &'a InMemoryFleetStore,
    journal: RefCell<Option<Journal>>,
}

impl MemoryRestoreTransaction<'_> {
    fn record(&self, undo: Undo) {
        if let Some(journal) = self.journal.borrow_mut().as_mut() {
            journal.undo.push(undo);
        }
    }
}

impl RestoreTransaction for MemoryRestoreTransaction<'_> {
    fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>, RecoveryError> {
        self.store.get_mission(mission_id)
    }

    fn update_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
    ) -> Result<(), RecoveryError> {
        let mut inner = self.store.lock()?;
        let prior = inner.state.missions.get(mission_id).cloned();
        set_mission_status(&mut inner.state.missions, mission_id, status)?;
        drop(inner);
        self.record(Undo::Mission(mission_id.to_string(), prior));
        Ok(())
    }

    fn get_sortie(&self, sortie_id: &str) -> Result<Option<Sortie>, RecoveryError> {
        self.store.get_sortie(sortie_id)
    }

    fn update_sortie(&self, sortie: &Sortie) -> Result<(), RecoveryError> {
        let mut inner = self.store.lock()?;
        let prior = inner.state.sorties.insert(sortie.id.clone(), sortie.clone());
        drop(inner);
        self.record(Undo::Sortie(sortie.id.clone(), prior));
        Ok(())
    }

    fn acquire_lock(
        &self,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition, RecoveryError> {
        let mut inner = self.store.lock()?;
        let before: Vec<Lock> = inner
            .state
            .locks
            .iter()
            .filter(|l| l.file == request.file)
            .cloned()
            .collect();
        let acquisition = acquire_in(&mut inner.state.locks, request, now);
        let written: Vec<Undo> = inner
            .state
            .locks
            .iter()
            .filter(|l| l.file == request.file && !before.contains(l))
            .map(|l| Undo::Lock(l.id.clone(), before.iter().find(|b| b.id == l.id).cloned()))
            .collect();
        drop(inner);
        for undo in written {
            self.record(undo);
        }
        Ok(acquisition)
    }

    fn force_release_lock(&self, lock_id: &str, now: DateTime<Utc>) -> Result<(), RecoveryError> {
        let mut inner = self.store.lock()?;
        let prior = inner.state.locks.iter().find(|l| l.id == lock_id).cloned();
        if !release_in(&mut inner.state.locks, lock_id, now) {
            return Err(RecoveryError::not_found("lock", lock_id));
        }
        drop(inner);
        self.record(Undo::Lock(lock_id.to_string(), prior));
        Ok(())
    }

    fn requeue_message(
        &self,
        mission_id: &str,
        message: &MessageSnapshot,
    ) -> Result<(), RecoveryError> {
        let mut inner = self.store.lock()?;
        let prior = inner
            .state
            .messages
            .insert(message.id.clone(), message.to_pending(mission_id));
        drop(inner);
        self.record(Undo::Message(message.id.clone(), prior));
        Ok(())
    }

    fn mark_checkpoint_consumed(&self, checkpoint_id: &str) -> Result<bool, RecoveryError> {
        let mut inner = self.store.lock()?;
        let prior = inner.state.checkpoints.get(checkpoint_id).cloned();
        let consumed = consume_in(&mut inner.state.checkpoints, checkpoint_id)?;
        drop(inner);
        if consumed {
            self.record(Undo::Checkpoint(checkpoint_id.to_string(), prior));
        }
        Ok(consumed)
    }

    fn append_event(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        payload: EventPayload,
    ) -> Result<Event, KernelError> {
        validate_stream_id(stream_id)?;
        let inner = self.store.lock_kernel()?;
        let mut journal = self.journal.borrow_mut();
        let journal = journal
            .as_mut()
            .ok_or_else(|| KernelError::EventStore("restore transaction is closed".to_string()))?;
        let staged = journal
            .staged_events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .count() as u64;
        let sequence = committed_next_sequence(&inner.state.events, stream_id) + staged;
        let event = build_event(stream_type, stream_id, payload, sequence);
        journal.staged_events.push(event.clone());
        Ok(event)
    }

    fn commit(self: Box<Self>) -> Result<(), RecoveryError> {
        let Some(journal) = self.journal.borrow_mut().take() else {
            return Ok(());
        };
        let mut inner = self.store.lock()?;
        // Staged sequences are only valid while nobody else appended to their streams.
        let advanced = journal
            .staged_events
            .iter()
            .find(|e| e.sequence < committed_next_sequence(&inner.state.events, &e.stream_id))
            .map(|e| e.stream_id.clone());
        if let Some(stream_id) = advanced {
            undo_all(&mut inner.state, journal.undo);
            return Err(RecoveryError::Transaction(format!(
                "event stream {stream_id} advanced during the restore"
            )));
        }
        for event in journal.staged_events {
            inner
                .state
                .events
                .entry(event.stream_id.clone())
                .or_default()
                .push(event);
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), RecoveryError> {
        let Some(journal) = self.journal.borrow_mut().take() else {
            return Ok(());
        };
        let mut inner = self.store.lock()?;
        undo_all(&mut inner.state, journal.undo);
        Ok(())
    }
}

impl Drop for MemoryRestoreTransaction<'_> {
    fn drop(&mut self) {
        if let Some(journal) = self.journal.get_mut().take() {
            match self.store.inner.lock() {
                Ok(mut inner) => undo_all(&mut inner.state, journal.undo),
                Err(_) => log::warn!("restore_transaction_drop_failed reason=lock_poisoned"),
            }
        }
    }
}

impl TransactionControl for InMemoryFleetStore {
    fn begin_restore(&self) -> Result<Box<dyn RestoreTransaction + '_>, RecoveryError> {
        Ok(Box::new(MemoryRestoreTransaction {
            store: self,
            journal: RefCell::new(Some(Journal::default())),
        }))
    }
}

impl RestoreClaimRepository for InMemoryFleetStore {
    fn try_claim_restore(
        &self,
        mission_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RecoveryError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.claims.get(mission_id) {
            let stale = now - existing.claimed_at > Duration::milliseconds(RESTORE_CLAIM_STALE_MS);
            if existing.owner != owner && !stale {
                return Ok(false);
            }
        }
        inner.claims.insert(
            mission_id.to_string(),
            RestoreClaim {
                owner: owner.to_string(),
                claimed_at: now,
            },
        );
        Ok(true)
    }

    fn release_restore(&self, mission_id: &str, owner: &str) -> Result<(), RecoveryError> {
        let mut inner = self.lock()?;
        if inner
            .claims
            .get(mission_id)
            .is_some_and(|claim| claim.owner == owner)
        {
            inner.claims.remove(mission_id);
        }
        Ok(())
    }
}

impl EventStore for InMemoryFleetStore {
    fn append(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        payload: EventPayload,
    ) -> Result<Event, KernelError> {
        validate_stream_id(stream_id)?;
        let mut inner = self.lock_kernel()?;
        let log = inner.state.events.entry(stream_id.to_string()).or_default();
        let event = build_event(stream_type, stream_id, payload, next_sequence(log));
        log.push(event.clone());
        Ok(event)
    }

    fn query(&self, stream_id: &str, query: &EventQuery) -> Result<Vec<Event>, KernelError> {
        let inner = self.lock_kernel()?;
        Ok(inner
            .state
            .events
            .get(stream_id)
            .map(|log| apply_query(log, query))
            .unwrap_or_default())
    }

    fn get_latest(&self, stream_id: &str) -> Result<Option<Event>, KernelError> {
        let inner = self.lock_kernel()?;
        Ok(inner
            .state
            .events
            .get(stream_id)
            .and_then(|log| log.last())
            .cloned())
    }
}
