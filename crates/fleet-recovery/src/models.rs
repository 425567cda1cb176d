//! Domain models read and written by the recovery engine.
//!
//! Live entities (missions, sorties, locks, messages) belong to the coordination
//! layer. Snapshots are denormalized copies stored inside a [Checkpoint] so the
//! checkpoint stays valid after the live rows change or disappear.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use fleet_kernel::CheckpointTrigger;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Pending => "pending",
            MissionStatus::InProgress => "in_progress",
            MissionStatus::Completed => "completed",
            MissionStatus::Blocked => "blocked",
            MissionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MissionStatus::Pending),
            "in_progress" => Some(MissionStatus::InProgress),
            "completed" => Some(MissionStatus::Completed),
            "blocked" => Some(MissionStatus::Blocked),
            "cancelled" => Some(MissionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MissionStatus::Completed | MissionStatus::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortieStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
}

impl SortieStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortieStatus::Pending => "pending",
            SortieStatus::InProgress => "in_progress",
            SortieStatus::Blocked => "blocked",
            SortieStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SortieStatus::Pending),
            "in_progress" => Some(SortieStatus::InProgress),
            "blocked" => Some(SortieStatus::Blocked),
            "completed" => Some(SortieStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Mission {
    pub id: String,
    pub title: String,
    pub status: MissionStatus,
    pub total_sorties: u32,
    pub completed_sorties: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Mission {
    /// Completion percentage derived from sortie counts (0 when the mission has no sorties).
    pub fn progress_percent(&self) -> u8 {
        if self.total_sorties == 0 {
            return 0;
        }
        let pct = u64::from(self.completed_sorties) * 100 / u64::from(self.total_sorties);
        pct.min(100) as u8
    }

    /// When work began, falling back to creation time for missions never started.
    pub fn active_since(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Sortie {
    pub id: String,
    pub mission_id: String,
    pub title: String,
    pub status: SortieStatus,
    pub assigned_to: Option<String>,
    pub files: Vec<String>,
    pub progress: u8,
    pub progress_notes: Option<String>,
}

/// Exclusive, time-bounded claim on a file path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Lock {
    pub id: String,
    pub file: String,
    pub held_by: String,
    pub mission_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub purpose: String,
    pub timeout_ms: u64,
    pub released_at: Option<DateTime<Utc>>,
}

impl Lock {
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        age_ms(self.acquired_at, now)
    }

    /// Expired once `now - acquired_at > timeout_ms`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age_ms(now) > self.timeout_ms
    }

    /// Unreleased and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && !self.is_expired(now)
    }
}

/// Parameters for [crate::repository::LockRepository::acquire_lock].
#[derive(Clone, Debug, PartialEq)]
pub struct LockRequest {
    pub file: String,
    pub held_by: String,
    pub mission_id: Option<String>,
    pub purpose: String,
    pub timeout_ms: u64,
}

/// Outcome of a lock acquisition attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum LockAcquisition {
    Acquired(Lock),
    /// Another holder owns an active lock on the file.
    Conflict(Lock),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    pub id: String,
    pub mission_id: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
    pub delivered: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SortieSnapshot {
    pub id: String,
    pub title: String,
    pub status: SortieStatus,
    pub assigned_to: Option<String>,
    pub files: Vec<String>,
    pub progress: u8,
    pub progress_notes: Option<String>,
}

impl From<&Sortie> for SortieSnapshot {
    fn from(sortie: &Sortie) -> Self {
        Self {
            id: sortie.id.clone(),
            title: sortie.title.clone(),
            status: sortie.status,
            assigned_to: sortie.assigned_to.clone(),
            files: sortie.files.clone(),
            progress: sortie.progress,
            progress_notes: sortie.progress_notes.clone(),
        }
    }
}

impl SortieSnapshot {
    /// Writes the snapshot over `live`, or rebuilds the sortie when it no longer exists.
    pub fn apply_to(&self, mission_id: &str, live: Option<Sortie>) -> Sortie {
        let mut sortie = live.unwrap_or_else(|| Sortie {
            id: self.id.clone(),
            mission_id: mission_id.to_string(),
            title: self.title.clone(),
            status: self.status,
            assigned_to: None,
            files: Vec::new(),
            progress: 0,
            progress_notes: None,
        });
        sortie.status = self.status;
        sortie.assigned_to = self.assigned_to.clone();
        sortie.files = self.files.clone();
        sortie.progress = self.progress;
        sortie.progress_notes = self.progress_notes.clone();
        sortie
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LockSnapshot {
    pub id: String,
    pub file: String,
    pub held_by: String,
    pub acquired_at: DateTime<Utc>,
    pub purpose: String,
    pub timeout_ms: u64,
}

impl From<&Lock> for LockSnapshot {
    fn from(lock: &Lock) -> Self {
        Self {
            id: lock.id.clone(),
            file: lock.file.clone(),
            held_by: lock.held_by.clone(),
            acquired_at: lock.acquired_at,
            purpose: lock.purpose.clone(),
            timeout_ms: lock.timeout_ms,
        }
    }
}

impl LockSnapshot {
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        age_ms(self.acquired_at, now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age_ms(now) > self.timeout_ms
    }

    /// Request that re-acquires the lock for its holder with the same timeout.
    pub fn reacquire_request(&self, mission_id: &str) -> LockRequest {
        LockRequest {
            file: self.file.clone(),
            held_by: self.held_by.clone(),
            mission_id: Some(mission_id.to_string()),
            purpose: self.purpose.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MessageSnapshot {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
    pub delivered: bool,
}

impl From<&Message> for MessageSnapshot {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            subject: message.subject.clone(),
            payload: message.payload.clone(),
            sent_at: message.sent_at,
            delivered: message.delivered,
        }
    }
}

impl MessageSnapshot {
    /// Live message rebuilt from the snapshot, marked undelivered.
    pub fn to_pending(&self, mission_id: &str) -> Message {
        Message {
            id: self.id.clone(),
            mission_id: mission_id.to_string(),
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            subject: self.subject.clone(),
            payload: self.payload.clone(),
            sent_at: self.sent_at,
            delivered: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockerType {
    Exception,
    ApiError,
    LockTimeout,
    Dependency,
    MessageFailure,
    Other,
}

impl BlockerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockerType::Exception => "exception",
            BlockerType::ApiError => "api_error",
            BlockerType::LockTimeout => "lock_timeout",
            BlockerType::Dependency => "dependency",
            BlockerType::MessageFailure => "message_failure",
            BlockerType::Other => "other",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlockerInfo {
    #[serde(rename = "type")]
    pub blocker_type: BlockerType,
    pub description: String,
    pub affected_sortie: Option<String>,
    pub resolution_hint: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub error_code: Option<String>,
}

impl BlockerInfo {
    pub fn new(
        blocker_type: BlockerType,
        description: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            blocker_type,
            description: description.into(),
            affected_sortie: None,
            resolution_hint: None,
            timestamp,
            error_code: None,
        }
    }

    pub fn for_sortie(mut self, sortie_id: impl Into<String>) -> Self {
        self.affected_sortie = Some(sortie_id.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.resolution_hint = Some(hint.into());
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

/// Human and LLM readable narrative attached to a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RecoveryContext {
    pub last_action: String,
    pub next_steps: Vec<String>,
    pub blockers: Vec<BlockerInfo>,
    pub files_modified: Vec<String>,
    pub mission_summary: String,
    pub elapsed_time_ms: u64,
    pub last_activity_at: DateTime<Utc>,
}

/// Immutable point-in-time snapshot of a mission. Only `consumed` changes after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Checkpoint {
    pub id: String,
    pub mission_id: String,
    pub trigger: CheckpointTrigger,
    pub trigger_details: Option<String>,
    pub progress_percent: u8,
    pub created_by: String,
    pub timestamp: DateTime<Utc>,
    pub sorties: Vec<SortieSnapshot>,
    pub active_locks: Vec<LockSnapshot>,
    pub pending_messages: Vec<MessageSnapshot>,
    pub recovery_context: RecoveryContext,
    pub ttl_hours: u32,
    pub consumed: bool,
}

impl Checkpoint {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.timestamp + Duration::hours(i64::from(self.ttl_hours))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        age_ms(self.timestamp, now)
    }
}

/// A stale mission paired with its best available checkpoint. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RecoveryCandidate {
    pub mission_id: String,
    pub mission_title: String,
    pub last_activity_at: DateTime<Utc>,
    pub inactivity_duration_ms: u64,
    pub checkpoint_id: Option<String>,
    pub checkpoint_progress: Option<u8>,
}

impl RecoveryCandidate {
    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_id.is_some()
    }
}

/// Milliseconds from `since` to `now`, clamped at zero for clock skew.
pub fn age_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - since).num_milliseconds().max(0) as u64
}
