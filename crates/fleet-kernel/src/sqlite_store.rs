//! SQLite-backed event log store.
//!
//! This module is feature-gated behind `sqlite-persistence`. The free functions operate
//! on a borrowed [Connection] so other stores sharing the database (and its open
//! transaction) can append to the same log.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use crate::event::{
    validate_stream_id, Event, EventPayload, EventQuery, EventStore, KernelError, SortOrder,
    StreamType,
};
use crate::identity::Seq;

const APPEND_MAX_ATTEMPTS: u32 = 32;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn map_event_err(prefix: &str, err: impl std::fmt::Display) -> KernelError {
    KernelError::EventStore(format!("{prefix}: {err}"))
}

pub fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Opens a connection with the pragmas every fleet store expects.
pub fn open_connection(path: &Path) -> Result<Connection, KernelError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| map_event_err("create parent dir", e))?;
        }
    }
    let conn = Connection::open(path).map_err(|e| map_event_err("open sqlite db", e))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| map_event_err("set journal_mode", e))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| map_event_err("set synchronous", e))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| map_event_err("set busy_timeout", e))?;
    Ok(conn)
}

pub fn ensure_event_schema(conn: &Connection) -> Result<(), KernelError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS fleet_events (
            id TEXT PRIMARY KEY,
            stream_type TEXT NOT NULL,
            stream_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            data_json TEXT NOT NULL,
            occurred_at_ms INTEGER NOT NULL,
            sequence INTEGER NOT NULL,
            UNIQUE (stream_id, sequence)
        );
        CREATE INDEX IF NOT EXISTS idx_fleet_events_stream_time
        ON fleet_events (stream_id, occurred_at_ms);
        ",
    )
    .map_err(|e| map_event_err("ensure schema", e))?;
    Ok(())
}

fn is_retryable(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation || e.code == ErrorCode::DatabaseBusy
    )
}

/// Appends one event, assigning `MAX(sequence) + 1` in the same statement.
///
/// The `UNIQUE (stream_id, sequence)` key rejects a racing writer from another
/// connection; that writer retries with a fresh maximum.
pub fn append_event(
    conn: &Connection,
    stream_type: StreamType,
    stream_id: &str,
    payload: EventPayload,
) -> Result<Event, KernelError> {
    validate_stream_id(stream_id)?;
    let event_type = payload.event_type();
    let data = match serde_json::to_value(&payload)
        .map_err(|e| map_event_err("serialize event", e))?
    {
        serde_json::Value::Object(mut map) => map.remove("data").unwrap_or_default(),
        other => other,
    };
    let data_json = data.to_string();

    let mut attempt = 0;
    loop {
        attempt += 1;
        let id = Uuid::new_v4().to_string();
        let occurred_at = ms_to_dt(dt_to_ms(Utc::now()));
        let inserted = conn.query_row(
            "INSERT INTO fleet_events
                 (id, stream_type, stream_id, event_type, data_json, occurred_at_ms, sequence)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, COALESCE(MAX(sequence), 0) + 1
             FROM fleet_events WHERE stream_id = ?3
             RETURNING sequence",
            params![
                id,
                stream_type.as_str(),
                stream_id,
                event_type.as_str(),
                data_json,
                dt_to_ms(occurred_at)
            ],
            |row| row.get::<_, i64>(0),
        );
        match inserted {
            Ok(sequence) => {
                return Ok(Event {
                    id,
                    stream_type,
                    stream_id: stream_id.to_string(),
                    payload,
                    occurred_at,
                    sequence: sequence as Seq,
                })
            }
            Err(err) if is_retryable(&err) && attempt < APPEND_MAX_ATTEMPTS => {
                std::thread::sleep(Duration::from_millis(u64::from(attempt)));
            }
            Err(err) => return Err(map_event_err("insert event", err)),
        }
    }
}

fn decode_row(row: &rusqlite::Row) -> rusqlite::Result<Result<Event, KernelError>> {
    let id: String = row.get(0)?;
    let stream_type: String = row.get(1)?;
    let stream_id: String = row.get(2)?;
    let event_type: String = row.get(3)?;
    let data_json: String = row.get(4)?;
    let occurred_at_ms: i64 = row.get(5)?;
    let sequence: i64 = row.get(6)?;
    Ok(decode_event(
        id,
        &stream_type,
        stream_id,
        &event_type,
        &data_json,
        occurred_at_ms,
        sequence,
    ))
}

fn decode_event(
    id: String,
    stream_type: &str,
    stream_id: String,
    event_type: &str,
    data_json: &str,
    occurred_at_ms: i64,
    sequence: i64,
) -> Result<Event, KernelError> {
    let stream_type = StreamType::parse(stream_type).ok_or_else(|| {
        KernelError::Validation(format!("event {id}: unknown stream_type '{stream_type}'"))
    })?;
    let data: serde_json::Value = serde_json::from_str(data_json)
        .map_err(|e| KernelError::Validation(format!("event {id}: bad data json: {e}")))?;
    let payload: EventPayload = serde_json::from_value(serde_json::json!({
        "event_type": event_type,
        "data": data,
    }))
    .map_err(|e| KernelError::Validation(format!("event {id}: {e}")))?;
    Ok(Event {
        id,
        stream_type,
        stream_id,
        payload,
        occurred_at: ms_to_dt(occurred_at_ms),
        sequence: sequence as Seq,
    })
}

const SELECT_COLUMNS: &str =
    "SELECT id, stream_type, stream_id, event_type, data_json, occurred_at_ms, sequence FROM fleet_events";

pub fn query_events(
    conn: &Connection,
    stream_id: &str,
    query: &EventQuery,
) -> Result<Vec<Event>, KernelError> {
    let mut sql = format!("{SELECT_COLUMNS} WHERE stream_id = ?1");
    let mut values: Vec<SqlValue> = vec![SqlValue::Text(stream_id.to_string())];
    let mut push = |clause: &str, value: SqlValue, sql: &mut String| {
        values.push(value);
        sql.push_str(&format!(" AND {clause} ?{}", values.len()));
    };
    if let Some(event_type) = query.event_type {
        push(
            "event_type =",
            SqlValue::Text(event_type.as_str().to_string()),
            &mut sql,
        );
    }
    if let Some(from) = query.from_sequence {
        push("sequence >=", SqlValue::Integer(from as i64), &mut sql);
    }
    if let Some(to) = query.to_sequence {
        push("sequence <=", SqlValue::Integer(to as i64), &mut sql);
    }
    if let Some(from) = query.from_time {
        push("occurred_at_ms >=", SqlValue::Integer(dt_to_ms(from)), &mut sql);
    }
    if let Some(to) = query.to_time {
        push("occurred_at_ms <=", SqlValue::Integer(dt_to_ms(to)), &mut sql);
    }
    let order = match query.order {
        SortOrder::Ascending => "ASC",
        SortOrder::Descending => "DESC",
    };
    let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
    values.push(SqlValue::Integer(limit));
    values.push(SqlValue::Integer(query.offset as i64));
    sql.push_str(&format!(
        " ORDER BY sequence {order} LIMIT ?{} OFFSET ?{}",
        values.len() - 1,
        values.len()
    ));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| map_event_err("prepare query", e))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), decode_row)
        .map_err(|e| map_event_err("query events", e))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| map_event_err("row decode", e))??);
    }
    Ok(out)
}

pub fn latest_event(conn: &Connection, stream_id: &str) -> Result<Option<Event>, KernelError> {
    let sql = format!("{SELECT_COLUMNS} WHERE stream_id = ?1 ORDER BY sequence DESC LIMIT 1");
    let row = conn
        .query_row(&sql, params![stream_id], decode_row)
        .optional()
        .map_err(|e| map_event_err("read latest", e))?;
    row.transpose()
}

/// SQLite-backed event log store.
pub struct SqliteEventStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, KernelError> {
        let db_path = path.into();
        let conn = open_connection(&db_path)?;
        ensure_event_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, KernelError> {
        self.conn
            .lock()
            .map_err(|_| map_event_err("lock poisoned", "mutex poisoned"))
    }
}

impl EventStore for SqliteEventStore {
    fn append(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        payload: EventPayload,
    ) -> Result<Event, KernelError> {
        let conn = self.conn()?;
        append_event(&conn, stream_type, stream_id, payload)
    }

    fn query(&self, stream_id: &str, query: &EventQuery) -> Result<Vec<Event>, KernelError> {
        let conn = self.conn()?;
        query_events(&conn, stream_id, query)
    }

    fn get_latest(&self, stream_id: &str) -> Result<Option<Event>, KernelError> {
        let conn = self.conn()?;
        latest_event(&conn, stream_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::event::{EventType, FleetRecoveredData, SortieProgressData};

    fn test_db_path(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("fleet-kernel-{name}-{ts}.sqlite"))
    }

    fn progress(p: u8) -> EventPayload {
        EventPayload::SortieProgress(SortieProgressData {
            mission_id: "m1".into(),
            sortie_id: "s1".into(),
            progress: p,
            notes: Some("halfway".into()),
        })
    }

    #[test]
    fn sqlite_event_store_roundtrip() {
        let store = SqliteEventStore::open(test_db_path("roundtrip")).unwrap();
        assert_eq!(store.head("m1").unwrap(), 0);

        let first = store.append(StreamType::Mission, "m1", progress(25)).unwrap();
        assert_eq!(first.sequence, 1);
        let restored_at = ms_to_dt(1_700_000_000_000);
        let second = store
            .append(
                StreamType::Mission,
                "m1",
                EventPayload::FleetRecovered(FleetRecoveredData {
                    checkpoint_id: "chk-1".into(),
                    restored_at,
                    sorties_restored: 4,
                    locks_restored: 1,
                    messages_requeued: 0,
                    warnings: 0,
                }),
            )
            .unwrap();
        assert_eq!(second.sequence, 2);

        let all = store.query("m1", &EventQuery::new()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], first);
        assert_eq!(all[1], second);

        let latest = store.get_latest("m1").unwrap().unwrap();
        assert_eq!(latest.event_type(), EventType::FleetRecovered);
        match latest.payload {
            EventPayload::FleetRecovered(data) => assert_eq!(data.restored_at, restored_at),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn sqlite_query_filters_and_descending_paging() {
        let store = SqliteEventStore::open(test_db_path("query")).unwrap();
        for p in [10, 20, 30] {
            store.append(StreamType::Mission, "m1", progress(p)).unwrap();
        }
        store.append(StreamType::Mission, "m2", progress(99)).unwrap();

        let desc = store
            .query("m1", &EventQuery::new().descending().with_offset(1))
            .unwrap();
        assert_eq!(
            desc.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![2, 1]
        );
        let typed = store
            .query(
                "m1",
                &EventQuery::new()
                    .with_type(EventType::SortieProgress)
                    .with_sequence_range(Some(2), None)
                    .with_limit(1),
            )
            .unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].sequence, 2);
        let none = store
            .query("m1", &EventQuery::new().with_type(EventType::FleetRecovered))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn sqlite_concurrent_connections_never_duplicate_sequences() {
        let path = test_db_path("concurrent");
        SqliteEventStore::open(&path).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = Arc::new(SqliteEventStore::open(&path).unwrap());
                    for i in 0..20u8 {
                        store.append(StreamType::Mission, "shared", progress(i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let store = SqliteEventStore::open(&path).unwrap();
        let seqs: Vec<Seq> = store
            .query("shared", &EventQuery::new())
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, (1..=80).collect::<Vec<Seq>>());
    }

    #[test]
    fn undecodable_row_surfaces_validation_error() {
        let store = SqliteEventStore::open(test_db_path("corrupt")).unwrap();
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO fleet_events VALUES ('bad', 'mission', 'm1', 'mission_exploded', '{}', 0, 1)",
                [],
            )
            .unwrap();
        }
        let err = store.get_latest("m1").unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));
    }
}
