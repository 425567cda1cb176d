//! In-memory EventStore implementation for the kernel.
//!
//! Append is atomic under one write lock; query returns events in sequence order.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use uuid::Uuid;

use crate::event::{
    validate_stream_id, Event, EventPayload, EventQuery, EventStore, KernelError, SortOrder,
    StreamType,
};
use crate::identity::{Seq, StreamId};

/// Next sequence for a log kept in ascending order.
pub fn next_sequence(log: &[Event]) -> Seq {
    log.last().map(|e| e.sequence + 1).unwrap_or(1)
}

/// Applies filters, ordering and paging to an ascending log.
pub fn apply_query(log: &[Event], query: &EventQuery) -> Vec<Event> {
    let matched = log.iter().filter(|e| query.matches(e));
    let limit = query.limit.unwrap_or(usize::MAX);
    match query.order {
        SortOrder::Ascending => matched.skip(query.offset).take(limit).cloned().collect(),
        SortOrder::Descending => matched
            .rev()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect(),
    }
}

/// Builds the event that will be appended at `sequence`.
pub fn build_event(
    stream_type: StreamType,
    stream_id: &str,
    payload: EventPayload,
    sequence: Seq,
) -> Event {
    Event {
        id: Uuid::new_v4().to_string(),
        stream_type,
        stream_id: stream_id.to_string(),
        payload,
        occurred_at: Utc::now(),
        sequence,
    }
}

/// In-memory event store: one log per stream, sequence assigned on append.
pub struct InMemoryEventStore {
    /// stream_id -> ordered events (seq 1, 2, 3, ...)
    logs: RwLock<HashMap<StreamId, Vec<Event>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        payload: EventPayload,
    ) -> Result<Event, KernelError> {
        validate_stream_id(stream_id)?;
        let mut logs = self
            .logs
            .write()
            .map_err(|e| KernelError::EventStore(e.to_string()))?;
        let log = logs.entry(stream_id.to_string()).or_default();
        let event = build_event(stream_type, stream_id, payload, next_sequence(log));
        log.push(event.clone());
        Ok(event)
    }

    fn query(&self, stream_id: &str, query: &EventQuery) -> Result<Vec<Event>, KernelError> {
        let logs = self
            .logs
            .read()
            .map_err(|e| KernelError::EventStore(e.to_string()))?;
        Ok(logs
            .get(stream_id)
            .map(|log| apply_query(log, query))
            .unwrap_or_default())
    }

    fn get_latest(&self, stream_id: &str) -> Result<Option<Event>, KernelError> {
        let logs = self
            .logs
            .read()
            .map_err(|e| KernelError::EventStore(e.to_string()))?;
        Ok(logs.get(stream_id).and_then(|l| l.last()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::event::{EventType, SortieProgressData};

    fn progress(sortie: &str, progress: u8) -> EventPayload {
        EventPayload::SortieProgress(SortieProgressData {
            mission_id: "m1".into(),
            sortie_id: sortie.into(),
            progress,
            notes: None,
        })
    }

    #[test]
    fn sequences_start_at_one_per_stream() {
        let store = InMemoryEventStore::new();
        let a1 = store
            .append(StreamType::Mission, "m1", progress("s1", 10))
            .unwrap();
        let b1 = store
            .append(StreamType::Mission, "m2", progress("s9", 10))
            .unwrap();
        let a2 = store
            .append(StreamType::Mission, "m1", progress("s1", 20))
            .unwrap();
        assert_eq!(a1.sequence, 1);
        assert_eq!(b1.sequence, 1);
        assert_eq!(a2.sequence, 2);
        assert_eq!(store.head("m1").unwrap(), 2);
        assert_eq!(store.head("unknown").unwrap(), 0);
    }

    #[test]
    fn concurrent_appenders_produce_gapless_sequences() {
        let store = Arc::new(InMemoryEventStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..25u8 {
                        store
                            .append(StreamType::Mission, "shared", progress(&format!("s{t}"), i))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let events = store.query("shared", &EventQuery::new()).unwrap();
        let seqs: Vec<Seq> = events.iter().map(|e| e.sequence).collect();
        let expected: Vec<Seq> = (1..=200).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn query_filters_orders_and_pages() {
        let store = InMemoryEventStore::new();
        for p in [10, 20, 30, 40] {
            store
                .append(StreamType::Mission, "m1", progress("s1", p))
                .unwrap();
        }
        store
            .append(
                StreamType::Mission,
                "m1",
                EventPayload::MessageSent(crate::event::MessageSentData {
                    message_id: "msg-1".into(),
                    sender: "a".into(),
                    recipient: "b".into(),
                }),
            )
            .unwrap();

        let only_progress = store
            .query("m1", &EventQuery::new().with_type(EventType::SortieProgress))
            .unwrap();
        assert_eq!(only_progress.len(), 4);

        let desc = store
            .query("m1", &EventQuery::new().descending().with_limit(2))
            .unwrap();
        assert_eq!(
            desc.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![5, 4]
        );

        let paged = store
            .query(
                "m1",
                &EventQuery::new()
                    .with_sequence_range(Some(2), Some(4))
                    .with_offset(1),
            )
            .unwrap();
        assert_eq!(
            paged.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![3, 4]
        );

        let latest = store.get_latest("m1").unwrap().unwrap();
        assert_eq!(latest.sequence, 5);
        assert_eq!(latest.event_type(), EventType::MessageSent);
    }

    #[test]
    fn empty_stream_id_is_rejected_without_side_effects() {
        let store = InMemoryEventStore::new();
        let err = store
            .append(StreamType::Mission, "  ", progress("s1", 1))
            .unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));
        assert_eq!(store.head("  ").unwrap(), 0);
    }
}
