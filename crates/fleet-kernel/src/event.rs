//! Event type and EventStore for the fleet kernel.
//!
//! Constraints: append is atomic (all or nothing); sequence is assigned by the store,
//! per stream, starting at 1 with no gaps; query returns events ordered by sequence.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::identity::{EventId, Seq, StreamId};

/// Kind of entity a stream belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Mission,
    Sortie,
    Specialist,
    Lock,
    Checkpoint,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Mission => "mission",
            StreamType::Sortie => "sortie",
            StreamType::Specialist => "specialist",
            StreamType::Lock => "lock",
            StreamType::Checkpoint => "checkpoint",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mission" => Some(StreamType::Mission),
            "sortie" => Some(StreamType::Sortie),
            "specialist" => Some(StreamType::Specialist),
            "lock" => Some(StreamType::Lock),
            "checkpoint" => Some(StreamType::Checkpoint),
            _ => None,
        }
    }
}

/// What caused a checkpoint to be taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    Progress,
    Error,
    Manual,
}

impl CheckpointTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointTrigger::Progress => "progress",
            CheckpointTrigger::Error => "error",
            CheckpointTrigger::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "progress" => Some(CheckpointTrigger::Progress),
            "error" => Some(CheckpointTrigger::Error),
            "manual" => Some(CheckpointTrigger::Manual),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MissionStartedData {
    pub mission_id: String,
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MissionCompletedData {
    pub mission_id: String,
    pub completed_sorties: u32,
    pub total_sorties: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SortieProgressData {
    pub mission_id: String,
    pub sortie_id: String,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SortieStatusChangedData {
    pub mission_id: String,
    pub sortie_id: String,
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LockAcquiredData {
    pub lock_id: String,
    pub file: String,
    pub held_by: String,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LockReleasedData {
    pub lock_id: String,
    pub file: String,
    pub held_by: String,
    /// True when the lock was taken away from its holder (e.g. forced restore).
    pub forced: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MessageSentData {
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CheckpointCreatedData {
    pub checkpoint_id: String,
    pub mission_id: String,
    pub trigger: CheckpointTrigger,
    pub progress_percent: u8,
    pub created_by: String,
}

/// Payload of the `fleet_recovered` event appended by a successful restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FleetRecoveredData {
    pub checkpoint_id: String,
    pub restored_at: DateTime<Utc>,
    pub sorties_restored: u32,
    pub locks_restored: u32,
    pub messages_requeued: u32,
    /// Number of warnings the restore produced.
    pub warnings: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CheckpointsCleanedData {
    pub deleted: u64,
    pub missions_scanned: u64,
}

/// Typed event payload, one shape per known event type.
///
/// Serialized adjacently tagged so the wire form is `{"event_type": .., "data": {..}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    MissionStarted(MissionStartedData),
    MissionCompleted(MissionCompletedData),
    SortieProgress(SortieProgressData),
    SortieStatusChanged(SortieStatusChangedData),
    LockAcquired(LockAcquiredData),
    LockReleased(LockReleasedData),
    MessageSent(MessageSentData),
    CheckpointCreated(CheckpointCreatedData),
    FleetRecovered(FleetRecoveredData),
    CheckpointsCleaned(CheckpointsCleanedData),
}

/// Fieldless mirror of [EventPayload] used for filtering and storage columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MissionStarted,
    MissionCompleted,
    SortieProgress,
    SortieStatusChanged,
    LockAcquired,
    LockReleased,
    MessageSent,
    CheckpointCreated,
    FleetRecovered,
    CheckpointsCleaned,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MissionStarted => "mission_started",
            EventType::MissionCompleted => "mission_completed",
            EventType::SortieProgress => "sortie_progress",
            EventType::SortieStatusChanged => "sortie_status_changed",
            EventType::LockAcquired => "lock_acquired",
            EventType::LockReleased => "lock_released",
            EventType::MessageSent => "message_sent",
            EventType::CheckpointCreated => "checkpoint_created",
            EventType::FleetRecovered => "fleet_recovered",
            EventType::CheckpointsCleaned => "checkpoints_cleaned",
        }
    }
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::MissionStarted(_) => EventType::MissionStarted,
            EventPayload::MissionCompleted(_) => EventType::MissionCompleted,
            EventPayload::SortieProgress(_) => EventType::SortieProgress,
            EventPayload::SortieStatusChanged(_) => EventType::SortieStatusChanged,
            EventPayload::LockAcquired(_) => EventType::LockAcquired,
            EventPayload::LockReleased(_) => EventType::LockReleased,
            EventPayload::MessageSent(_) => EventType::MessageSent,
            EventPayload::CheckpointCreated(_) => EventType::CheckpointCreated,
            EventPayload::FleetRecovered(_) => EventType::FleetRecovered,
            EventPayload::CheckpointsCleaned(_) => EventType::CheckpointsCleaned,
        }
    }

    /// One-line human readable description, used as "last action" in recovery narratives.
    pub fn describe(&self) -> String {
        match self {
            EventPayload::MissionStarted(d) => format!("Mission '{}' started", d.title),
            EventPayload::MissionCompleted(d) => format!(
                "Mission completed ({}/{} sorties)",
                d.completed_sorties, d.total_sorties
            ),
            EventPayload::SortieProgress(d) => match &d.notes {
                Some(notes) => format!(
                    "Sortie {} reached {}%: {}",
                    d.sortie_id, d.progress, notes
                ),
                None => format!("Sortie {} reached {}%", d.sortie_id, d.progress),
            },
            EventPayload::SortieStatusChanged(d) => {
                format!("Sortie {} moved from {} to {}", d.sortie_id, d.from, d.to)
            }
            EventPayload::LockAcquired(d) => format!("{} locked {}", d.held_by, d.file),
            EventPayload::LockReleased(d) if d.forced => {
                format!("Lock on {} was force-released from {}", d.file, d.held_by)
            }
            EventPayload::LockReleased(d) => format!("{} released {}", d.held_by, d.file),
            EventPayload::MessageSent(d) => {
                format!("{} sent message {} to {}", d.sender, d.message_id, d.recipient)
            }
            EventPayload::CheckpointCreated(d) => format!(
                "Checkpoint {} created ({} trigger, {}%)",
                d.checkpoint_id,
                d.trigger.as_str(),
                d.progress_percent
            ),
            EventPayload::FleetRecovered(d) => format!(
                "Recovered from checkpoint {} ({} sorties, {} locks, {} messages)",
                d.checkpoint_id, d.sorties_restored, d.locks_restored, d.messages_requeued
            ),
            EventPayload::CheckpointsCleaned(d) => {
                format!("Cleanup removed {} checkpoints", d.deleted)
            }
        }
    }
}

/// A single immutable entry in a stream's log.
///
/// Wire shape: `{id, stream_type, stream_id, event_type, data, occurred_at, sequence}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    pub id: EventId,
    pub stream_type: StreamType,
    pub stream_id: StreamId,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub occurred_at: DateTime<Utc>,
    pub sequence: Seq,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter for [EventStore::query]. Sequence and time bounds are inclusive.
#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    pub event_type: Option<EventType>,
    pub from_sequence: Option<Seq>,
    pub to_sequence: Option<Seq>,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub order: SortOrder,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn with_sequence_range(mut self, from: Option<Seq>, to: Option<Seq>) -> Self {
        self.from_sequence = from;
        self.to_sequence = to;
        self
    }

    pub fn with_time_range(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.from_time = from;
        self.to_time = to;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    /// Returns true if the event passes every filter (ordering and paging excluded).
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(event_type) = self.event_type {
            if event.event_type() != event_type {
                return false;
            }
        }
        if self.from_sequence.is_some_and(|from| event.sequence < from) {
            return false;
        }
        if self.to_sequence.is_some_and(|to| event.sequence > to) {
            return false;
        }
        if self.from_time.is_some_and(|from| event.occurred_at < from) {
            return false;
        }
        if self.to_time.is_some_and(|to| event.occurred_at > to) {
            return false;
        }
        true
    }
}

/// Event store: append-only log per stream.
///
/// **Constraints (must hold in all implementations and tests):**
/// - `append` is atomic: on error no partial event is visible.
/// - `sequence` is assigned by the store, per stream, starting at 1, gapless and
///   unique even under concurrent appenders.
/// - `query` returns events ordered by sequence in the requested direction.
pub trait EventStore: Send + Sync {
    /// Appends one event and returns it with its assigned id, timestamp and sequence.
    fn append(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        payload: EventPayload,
    ) -> Result<Event, KernelError>;

    /// Returns the events of one stream that match `query`.
    fn query(&self, stream_id: &str, query: &EventQuery) -> Result<Vec<Event>, KernelError>;

    /// Returns the highest-sequence event of the stream, if any.
    fn get_latest(&self, stream_id: &str) -> Result<Option<Event>, KernelError>;

    /// Returns the highest sequence of the stream (0 if empty).
    fn head(&self, stream_id: &str) -> Result<Seq, KernelError> {
        Ok(self.get_latest(stream_id)?.map(|e| e.sequence).unwrap_or(0))
    }
}

impl<T: EventStore + ?Sized> EventStore for std::sync::Arc<T> {
    fn append(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        payload: EventPayload,
    ) -> Result<Event, KernelError> {
        (**self).append(stream_type, stream_id, payload)
    }

    fn query(&self, stream_id: &str, query: &EventQuery) -> Result<Vec<Event>, KernelError> {
        (**self).query(stream_id, query)
    }

    fn get_latest(&self, stream_id: &str) -> Result<Option<Event>, KernelError> {
        (**self).get_latest(stream_id)
    }

    fn head(&self, stream_id: &str) -> Result<Seq, KernelError> {
        (**self).head(stream_id)
    }
}

/// Kernel-level error type.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The backing store failed or is unavailable.
    #[error("EventStore error: {0}")]
    EventStore(String),
    /// Malformed event data (bad stream id, undecodable payload).
    #[error("Validation error: {0}")]
    Validation(String),
}

pub fn validate_stream_id(stream_id: &str) -> Result<(), KernelError> {
    if stream_id.trim().is_empty() {
        return Err(KernelError::Validation(
            "stream_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: "evt-1".into(),
            stream_type: StreamType::Mission,
            stream_id: "m1".into(),
            payload: EventPayload::CheckpointCreated(CheckpointCreatedData {
                checkpoint_id: "chk-1".into(),
                mission_id: "m1".into(),
                trigger: CheckpointTrigger::Progress,
                progress_percent: 50,
                created_by: "specialist-a".into(),
            }),
            occurred_at: Utc::now(),
            sequence: 3,
        }
    }

    #[test]
    fn event_serializes_to_flat_wire_shape() {
        let value = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(value["event_type"], "checkpoint_created");
        assert_eq!(value["data"]["checkpoint_id"], "chk-1");
        assert_eq!(value["data"]["trigger"], "progress");
        assert_eq!(value["stream_type"], "mission");
        assert_eq!(value["sequence"], 3);
        assert!(value["occurred_at"].is_string());
    }

    #[test]
    fn unknown_event_type_fails_to_decode() {
        let raw = serde_json::json!({
            "id": "evt-9",
            "stream_type": "mission",
            "stream_id": "m1",
            "event_type": "mission_exploded",
            "data": {},
            "occurred_at": "2026-01-01T00:00:00Z",
            "sequence": 1
        });
        assert!(serde_json::from_value::<Event>(raw).is_err());
    }

    #[test]
    fn query_matches_type_and_inclusive_bounds() {
        let event = sample_event();
        assert!(EventQuery::new().matches(&event));
        assert!(EventQuery::new()
            .with_type(EventType::CheckpointCreated)
            .matches(&event));
        assert!(!EventQuery::new()
            .with_type(EventType::FleetRecovered)
            .matches(&event));
        assert!(EventQuery::new()
            .with_sequence_range(Some(3), Some(3))
            .matches(&event));
        assert!(!EventQuery::new()
            .with_sequence_range(Some(4), None)
            .matches(&event));
        assert!(!EventQuery::new()
            .with_time_range(Some(event.occurred_at + chrono::Duration::seconds(1)), None)
            .matches(&event));
    }

    #[test]
    fn describe_mentions_checkpoint_and_trigger() {
        let text = sample_event().payload.describe();
        assert!(text.contains("chk-1"));
        assert!(text.contains("progress"));
    }
}
