//! Fleet kernel: the append-only event log every recovery component builds on.
//!
//! Events are immutable facts recorded per stream (usually one stream per mission).
//! Sequence numbers are assigned by the store on append, start at 1 and never repeat
//! or skip within a stream. Live mission state is owned elsewhere; the log is the
//! audit and activity trail that inactivity detection and recovery read.

pub mod event;
pub mod event_store;
pub mod identity;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;

pub use event::{
    CheckpointCreatedData, CheckpointTrigger, CheckpointsCleanedData, Event, EventPayload,
    EventQuery, EventStore, EventType, FleetRecoveredData, KernelError, LockAcquiredData,
    LockReleasedData, MessageSentData, MissionCompletedData, MissionStartedData, SortOrder,
    SortieProgressData, SortieStatusChangedData, StreamType,
};
pub use event::validate_stream_id;
pub use event_store::{apply_query, build_event, next_sequence, InMemoryEventStore};
pub use identity::{EventId, Seq, StreamId};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteEventStore;
