//! Stream identity types for the fleet event log.
//!
//! StreamId names one ordered log; Seq is the monotonically increasing
//! sequence number within that log.

/// Identifies one ordered event stream (a mission id, a sortie id, ...).
pub type StreamId = String;

/// Identifies a single appended event.
pub type EventId = String;

/// Per-stream event sequence number. The first event of a stream has seq 1.
pub type Seq = u64;
