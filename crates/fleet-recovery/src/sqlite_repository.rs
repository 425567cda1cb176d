//! SQLite-backed fleet store.
//!
//! Live tables, checkpoints, restore claims and the event log share one database
//! file, so a restore transaction covers the events it appends. Each restore
//! opens its own connection and holds `BEGIN IMMEDIATE` on it; writes made
//! through the store's shared connection wait for it instead of joining it.
//! Several processes may open the same file; the partial unique index on
//! unreleased locks and the event sequence key keep them consistent.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params, Row};
use uuid::Uuid;

use fleet_kernel::sqlite_store::{
    append_event, dt_to_ms, ensure_event_schema, latest_event, ms_to_dt, open_connection,
    query_events,
};
use fleet_kernel::{Event, EventPayload, EventQuery, EventStore, KernelError, StreamType};

use crate::error::{map_store_err, RecoveryError};
use crate::models::{
    Checkpoint, Lock, LockAcquisition, LockRequest, Message, MessageSnapshot, Mission,
    MissionStatus, Sortie, SortieStatus,
};
use crate::repository::{
    CheckpointRepository, LockRepository, MessageRepository, MissionRepository,
    RestoreClaimRepository, RestoreTransaction, SortieRepository, TransactionControl,
    RESTORE_CLAIM_STALE_MS,
};

const MISSION_COLUMNS: &str =
    "id, title, status, total_sorties, completed_sorties, created_at_ms, started_at_ms";
const SORTIE_COLUMNS: &str =
    "id, mission_id, title, status, assigned_to, files_json, progress, progress_notes";
const LOCK_COLUMNS: &str =
    "id, file, held_by, mission_id, acquired_at_ms, purpose, timeout_ms, released_at_ms";
const MESSAGE_COLUMNS: &str =
    "id, mission_id, sender, recipient, subject, payload_json, sent_at_ms, delivered";

/// Cloning shares the connection.
#[derive(Clone)]
pub struct SqliteFleetStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFleetStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RecoveryError> {
        let db_path = path.into();
        let conn = open_connection(&db_path)?;
        ensure_event_schema(&conn)?;
        ensure_fleet_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RecoveryError> {
        self.conn
            .lock()
            .map_err(|_| RecoveryError::Store("sqlite fleet store lock poisoned".to_string()))
    }

    fn conn_kernel(&self) -> Result<MutexGuard<'_, Connection>, KernelError> {
        self.conn
            .lock()
            .map_err(|_| KernelError::EventStore("sqlite fleet store lock poisoned".to_string()))
    }

    /// Inserts or replaces a mission row.
    pub fn insert_mission(&self, mission: Mission) -> Result<(), RecoveryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO fleet_missions
                 (id, title, status, total_sorties, completed_sorties, created_at_ms, started_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 status = excluded.status,
                 total_sorties = excluded.total_sorties,
                 completed_sorties = excluded.completed_sorties,
                 created_at_ms = excluded.created_at_ms,
                 started_at_ms = excluded.started_at_ms",
            params![
                mission.id,
                mission.title,
                mission.status.as_str(),
                mission.total_sorties,
                mission.completed_sorties,
                dt_to_ms(mission.created_at),
                mission.started_at.map(dt_to_ms)
            ],
        )
        .map_err(|e| map_store_err("insert mission", e))?;
        Ok(())
    }

    /// Inserts or replaces a sortie row.
    pub fn insert_sortie(&self, sortie: Sortie) -> Result<(), RecoveryError> {
        self.update_sortie(&sortie)
    }

    pub fn send_message(&self, message: Message) -> Result<(), RecoveryError> {
        let conn = self.conn()?;
        upsert_message(&conn, &message)
    }

    /// Marks a message delivered. Returns false when it does not exist.
    pub fn ack_message(&self, message_id: &str) -> Result<bool, RecoveryError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE fleet_messages SET delivered = 1 WHERE id = ?1",
                params![message_id],
            )
            .map_err(|e| map_store_err("ack message", e))?;
        Ok(updated == 1)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>, RecoveryError> {
        let conn = self.conn()?;
        query_one(
            &conn,
            &format!("SELECT {MESSAGE_COLUMNS} FROM fleet_messages WHERE id = ?1"),
            params![message_id],
            message_from_row,
            "read message",
        )
    }

    pub fn release_lock(&self, lock_id: &str, now: DateTime<Utc>) -> Result<bool, RecoveryError> {
        let conn = self.conn()?;
        release_lock_on(&conn, lock_id, now)
    }
}

fn ensure_fleet_schema(conn: &Connection) -> Result<(), RecoveryError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS fleet_missions (
          id TEXT PRIMARY KEY,
          title TEXT NOT NULL,
          status TEXT NOT NULL,
          total_sorties INTEGER NOT NULL,
          completed_sorties INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL,
          started_at_ms INTEGER NULL
        );
        CREATE TABLE IF NOT EXISTS fleet_sorties (
          id TEXT PRIMARY KEY,
          mission_id TEXT NOT NULL,
          title TEXT NOT NULL,
          status TEXT NOT NULL,
          assigned_to TEXT NULL,
          files_json TEXT NOT NULL,
          progress INTEGER NOT NULL,
          progress_notes TEXT NULL
        );
        CREATE TABLE IF NOT EXISTS fleet_locks (
          id TEXT PRIMARY KEY,
          file TEXT NOT NULL,
          held_by TEXT NOT NULL,
          mission_id TEXT NULL,
          acquired_at_ms INTEGER NOT NULL,
          purpose TEXT NOT NULL,
          timeout_ms INTEGER NOT NULL,
          released_at_ms INTEGER NULL
        );
        CREATE TABLE IF NOT EXISTS fleet_messages (
          id TEXT PRIMARY KEY,
          mission_id TEXT NOT NULL,
          sender TEXT NOT NULL,
          recipient TEXT NOT NULL,
          subject TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          sent_at_ms INTEGER NOT NULL,
          delivered INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fleet_checkpoints (
          id TEXT PRIMARY KEY,
          mission_id TEXT NOT NULL,
          trigger_kind TEXT NOT NULL,
          progress_percent INTEGER NOT NULL,
          created_by TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          ttl_hours INTEGER NOT NULL,
          consumed INTEGER NOT NULL,
          body_json TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fleet_restore_claims (
          mission_id TEXT PRIMARY KEY,
          owner TEXT NOT NULL,
          claimed_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fleet_missions_status ON fleet_missions(status);
        CREATE INDEX IF NOT EXISTS idx_fleet_sorties_mission ON fleet_sorties(mission_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_fleet_locks_active_file
          ON fleet_locks(file) WHERE released_at_ms IS NULL;
        CREATE INDEX IF NOT EXISTS idx_fleet_locks_mission ON fleet_locks(mission_id);
        CREATE INDEX IF NOT EXISTS idx_fleet_messages_pending ON fleet_messages(mission_id, delivered);
        CREATE INDEX IF NOT EXISTS idx_fleet_checkpoints_mission
          ON fleet_checkpoints(mission_id, created_at_ms DESC);
        "#,
    )
    .map_err(|e| map_store_err("init sqlite fleet schema", e))?;
    Ok(())
}

fn conversion_err(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_column<T>(idx: usize, raw: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| conversion_err(idx, format!("unknown value '{raw}'")))
}

fn map_row_err(prefix: &str, err: rusqlite::Error) -> RecoveryError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(..) => {
            RecoveryError::Validation(format!("{prefix}: {err}"))
        }
        other => map_store_err(prefix, other),
    }
}

fn query_rows<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    decode: fn(&Row<'_>) -> rusqlite::Result<T>,
    context: &str,
) -> Result<Vec<T>, RecoveryError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| map_store_err(context, e))?;
    let rows = stmt
        .query_map(params, decode)
        .map_err(|e| map_store_err(context, e))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| map_row_err(context, e))?);
    }
    Ok(out)
}

fn query_one<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    decode: fn(&Row<'_>) -> rusqlite::Result<T>,
    context: &str,
) -> Result<Option<T>, RecoveryError> {
    conn.query_row(sql, params, decode)
        .optional()
        .map_err(|e| map_row_err(context, e))
}

fn mission_from_row(row: &Row<'_>) -> rusqlite::Result<Mission> {
    let status: String = row.get(2)?;
    Ok(Mission {
        id: row.get(0)?,
        title: row.get(1)?,
        status: parse_column(2, &status, MissionStatus::parse)?,
        total_sorties: row.get(3)?,
        completed_sorties: row.get(4)?,
        created_at: ms_to_dt(row.get(5)?),
        started_at: row.get::<_, Option<i64>>(6)?.map(ms_to_dt),
    })
}

fn sortie_from_row(row: &Row<'_>) -> rusqlite::Result<Sortie> {
    let status: String = row.get(3)?;
    let files_json: String = row.get(5)?;
    Ok(Sortie {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        title: row.get(2)?,
        status: parse_column(3, &status, SortieStatus::parse)?,
        assigned_to: row.get(4)?,
        files: serde_json::from_str(&files_json).map_err(|e| conversion_err(5, e))?,
        progress: row.get(6)?,
        progress_notes: row.get(7)?,
    })
}

fn lock_from_row(row: &Row<'_>) -> rusqlite::Result<Lock> {
    Ok(Lock {
        id: row.get(0)?,
        file: row.get(1)?,
        held_by: row.get(2)?,
        mission_id: row.get(3)?,
        acquired_at: ms_to_dt(row.get(4)?),
        purpose: row.get(5)?,
        timeout_ms: row.get::<_, i64>(6)?.max(0) as u64,
        released_at: row.get::<_, Option<i64>>(7)?.map(ms_to_dt),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let payload_json: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        subject: row.get(4)?,
        payload: serde_json::from_str(&payload_json).map_err(|e| conversion_err(5, e))?,
        sent_at: ms_to_dt(row.get(6)?),
        delivered: row.get(7)?,
    })
}

/// The body holds the immutable snapshot; the `consumed` column is authoritative.
fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let body: String = row.get(0)?;
    let mut checkpoint: Checkpoint =
        serde_json::from_str(&body).map_err(|e| conversion_err(0, e))?;
    checkpoint.consumed = row.get(1)?;
    Ok(checkpoint)
}

fn upsert_message(conn: &Connection, message: &Message) -> Result<(), RecoveryError> {
    conn.execute(
        "INSERT INTO fleet_messages
             (id, mission_id, sender, recipient, subject, payload_json, sent_at_ms, delivered)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             mission_id = excluded.mission_id,
             sender = excluded.sender,
             recipient = excluded.recipient,
             subject = excluded.subject,
             payload_json = excluded.payload_json,
             sent_at_ms = excluded.sent_at_ms,
             delivered = excluded.delivered",
        params![
            message.id,
            message.mission_id,
            message.sender,
            message.recipient,
            message.subject,
            message.payload.to_string(),
            dt_to_ms(message.sent_at),
            message.delivered
        ],
    )
    .map_err(|e| map_store_err("upsert message", e))?;
    Ok(())
}

fn with_savepoint<T>(
    conn: &Connection,
    write: impl FnOnce(&Connection) -> Result<T, RecoveryError>,
) -> Result<T, RecoveryError> {
    conn.execute_batch("SAVEPOINT fleet_write")
        .map_err(|e| map_store_err("begin savepoint", e))?;
    match write(conn) {
        Ok(value) => {
            conn.execute_batch("RELEASE fleet_write")
                .map_err(|e| map_store_err("release savepoint", e))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(undo) = conn.execute_batch("ROLLBACK TO fleet_write; RELEASE fleet_write") {
                log::warn!("sqlite_savepoint_rollback_failed error={}", undo);
            }
            Err(err)
        }
    }
}

fn read_mission(conn: &Connection, mission_id: &str) -> Result<Option<Mission>, RecoveryError> {
    query_one(
        conn,
        &format!("SELECT {MISSION_COLUMNS} FROM fleet_missions WHERE id = ?1"),
        params![mission_id],
        mission_from_row,
        "read mission",
    )
}

fn write_mission_status(
    conn: &Connection,
    mission_id: &str,
    status: MissionStatus,
) -> Result<(), RecoveryError> {
    let started_at = (status == MissionStatus::InProgress).then(|| dt_to_ms(Utc::now()));
    let updated = conn
        .execute(
            "UPDATE fleet_missions
             SET status = ?2, started_at_ms = COALESCE(started_at_ms, ?3)
             WHERE id = ?1",
            params![mission_id, status.as_str(), started_at],
        )
        .map_err(|e| map_store_err("update mission status", e))?;
    if updated == 0 {
        return Err(RecoveryError::not_found("mission", mission_id));
    }
    Ok(())
}

fn read_sortie(conn: &Connection, sortie_id: &str) -> Result<Option<Sortie>, RecoveryError> {
    query_one(
        conn,
        &format!("SELECT {SORTIE_COLUMNS} FROM fleet_sorties WHERE id = ?1"),
        params![sortie_id],
        sortie_from_row,
        "read sortie",
    )
}

fn write_sortie(conn: &Connection, sortie: &Sortie) -> Result<(), RecoveryError> {
    let files_json =
        serde_json::to_string(&sortie.files).map_err(|e| map_store_err("encode files", e))?;
    conn.execute(
        "INSERT INTO fleet_sorties
             (id, mission_id, title, status, assigned_to, files_json, progress, progress_notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             mission_id = excluded.mission_id,
             title = excluded.title,
             status = excluded.status,
             assigned_to = excluded.assigned_to,
             files_json = excluded.files_json,
             progress = excluded.progress,
             progress_notes = excluded.progress_notes",
        params![
            sortie.id,
            sortie.mission_id,
            sortie.title,
            sortie.status.as_str(),
            sortie.assigned_to,
            files_json,
            sortie.progress,
            sortie.progress_notes
        ],
    )
    .map_err(|e| map_store_err("update sortie", e))?;
    Ok(())
}

/// Expects to run inside a savepoint or transaction.
fn acquire_lock_on(
    conn: &Connection,
    request: &LockRequest,
    now: DateTime<Utc>,
) -> Result<LockAcquisition, RecoveryError> {
    let now = ms_to_dt(dt_to_ms(now));
    let active_sql =
        format!("SELECT {LOCK_COLUMNS} FROM fleet_locks WHERE file = ?1 AND released_at_ms IS NULL");
    let existing = query_one(
        conn,
        &active_sql,
        params![request.file],
        lock_from_row,
        "read lock for file",
    )?;
    if let Some(mut existing) = existing {
        if existing.is_expired(now) {
            conn.execute(
                "UPDATE fleet_locks SET released_at_ms = ?2 WHERE id = ?1",
                params![existing.id, dt_to_ms(now)],
            )
            .map_err(|e| map_store_err("release expired lock", e))?;
        } else if existing.held_by == request.held_by {
            conn.execute(
                "UPDATE fleet_locks SET acquired_at_ms = ?2, timeout_ms = ?3, purpose = ?4 WHERE id = ?1",
                params![
                    existing.id,
                    dt_to_ms(now),
                    request.timeout_ms as i64,
                    request.purpose
                ],
            )
            .map_err(|e| map_store_err("refresh lock", e))?;
            existing.acquired_at = now;
            existing.timeout_ms = request.timeout_ms;
            existing.purpose = request.purpose.clone();
            return Ok(LockAcquisition::Acquired(existing));
        } else {
            return Ok(LockAcquisition::Conflict(existing));
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
    match conn.execute(
        "INSERT INTO fleet_locks
             (id, file, held_by, mission_id, acquired_at_ms, purpose, timeout_ms, released_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
        params![
            lock.id,
            lock.file,
            lock.held_by,
            lock.mission_id,
            dt_to_ms(lock.acquired_at),
            lock.purpose,
            lock.timeout_ms as i64
        ],
    ) {
        Ok(_) => Ok(LockAcquisition::Acquired(lock)),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            // Another connection won the file between our read and insert.
            let winner = query_one(
                conn,
                &active_sql,
                params![request.file],
                lock_from_row,
                "read racing lock",
            )?;
            match winner {
                Some(winner) => Ok(LockAcquisition::Conflict(winner)),
                None => Err(RecoveryError::Store(format!(
                    "lock insert for {} rejected without an active holder",
                    request.file
                ))),
            }
        }
        Err(e) => Err(map_store_err("insert lock", e)),
    }
}

fn release_lock_on(
    conn: &Connection,
    lock_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, RecoveryError> {
    let updated = conn
        .execute(
            "UPDATE fleet_locks SET released_at_ms = ?2 WHERE id = ?1 AND released_at_ms IS NULL",
            params![lock_id, dt_to_ms(now)],
        )
        .map_err(|e| map_store_err("release lock", e))?;
    Ok(updated == 1)
}

fn consume_checkpoint(conn: &Connection, checkpoint_id: &str) -> Result<bool, RecoveryError> {
    let updated = conn
        .execute(
            "UPDATE fleet_checkpoints SET consumed = 1 WHERE id = ?1 AND consumed = 0",
            params![checkpoint_id],
        )
        .map_err(|e| map_store_err("mark checkpoint consumed", e))?;
    if updated == 1 {
        return Ok(true);
    }
    let exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM fleet_checkpoints WHERE id = ?1",
            params![checkpoint_id],
            |r| r.get(0),
        )
        .map_err(|e| map_store_err("check checkpoint exists", e))?;
    if exists == 0 {
        return Err(RecoveryError::not_found("checkpoint", checkpoint_id));
    }
    Ok(false)
}

impl MissionRepository for SqliteFleetStore {
    fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>, RecoveryError> {
        let conn = self.conn()?;
        read_mission(&conn, mission_id)
    }

    fn missions_by_status(&self, status: MissionStatus) -> Result<Vec<Mission>, RecoveryError> {
        let conn = self.conn()?;
        query_rows(
            &conn,
            &format!(
                "SELECT {MISSION_COLUMNS} FROM fleet_missions WHERE status = ?1 ORDER BY created_at_ms ASC, id ASC"
            ),
            params![status.as_str()],
            mission_from_row,
            "list missions by status",
        )
    }

    fn update_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
    ) -> Result<(), RecoveryError> {
        let conn = self.conn()?;
        write_mission_status(&conn, mission_id, status)
    }
}

impl SortieRepository for SqliteFleetStore {
    fn get_sortie(&self, sortie_id: &str) -> Result<Option<Sortie>, RecoveryError> {
        let conn = self.conn()?;
        read_sortie(&conn, sortie_id)
    }

    fn sorties_by_mission(&self, mission_id: &str) -> Result<Vec<Sortie>, RecoveryError> {
        let conn = self.conn()?;
        query_rows(
            &conn,
            &format!(
                "SELECT {SORTIE_COLUMNS} FROM fleet_sorties WHERE mission_id = ?1 ORDER BY id ASC"
            ),
            params![mission_id],
            sortie_from_row,
            "list sorties",
        )
    }

    fn update_sortie(&self, sortie: &Sortie) -> Result<(), RecoveryError> {
        let conn = self.conn()?;
        write_sortie(&conn, sortie)
    }
}

impl LockRepository for SqliteFleetStore {
    fn acquire_lock(
        &self,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition, RecoveryError> {
        let conn = self.conn()?;
        with_savepoint(&conn, |conn| acquire_lock_on(conn, request, now))
    }

    fn force_release_lock(&self, lock_id: &str, now: DateTime<Utc>) -> Result<(), RecoveryError> {
        if self.release_lock(lock_id, now)? {
            Ok(())
        } else {
            Err(RecoveryError::not_found("lock", lock_id))
        }
    }

    fn active_locks_for_mission(&self, mission_id: &str) -> Result<Vec<Lock>, RecoveryError> {
        let conn = self.conn()?;
        query_rows(
            &conn,
            &format!(
                "SELECT {LOCK_COLUMNS} FROM fleet_locks
                 WHERE mission_id = ?1 AND released_at_ms IS NULL
                 ORDER BY acquired_at_ms ASC"
            ),
            params![mission_id],
            lock_from_row,
            "list mission locks",
        )
    }

    fn active_lock_for_file(&self, file: &str) -> Result<Option<Lock>, RecoveryError> {
        let conn = self.conn()?;
        query_one(
            &conn,
            &format!(
                "SELECT {LOCK_COLUMNS} FROM fleet_locks WHERE file = ?1 AND released_at_ms IS NULL"
            ),
            params![file],
            lock_from_row,
            "read lock for file",
        )
    }
}

impl MessageRepository for SqliteFleetStore {
    fn pending_messages(&self, mission_id: &str) -> Result<Vec<Message>, RecoveryError> {
        let conn = self.conn()?;
        query_rows(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM fleet_messages
                 WHERE mission_id = ?1 AND delivered = 0
                 ORDER BY sent_at_ms ASC, id ASC"
            ),
            params![mission_id],
            message_from_row,
            "list pending messages",
        )
    }

    fn requeue_message(
        &self,
        mission_id: &str,
        message: &MessageSnapshot,
    ) -> Result<(), RecoveryError> {
        let conn = self.conn()?;
        upsert_message(&conn, &message.to_pending(mission_id))
    }
}

impl CheckpointRepository for SqliteFleetStore {
    fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RecoveryError> {
        let body =
            serde_json::to_string(checkpoint).map_err(|e| map_store_err("encode checkpoint", e))?;
        let conn = self.conn()?;
        match conn.execute(
            "INSERT INTO fleet_checkpoints
                 (id, mission_id, trigger_kind, progress_percent, created_by, created_at_ms,
                  ttl_hours, consumed, body_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                checkpoint.id,
                checkpoint.mission_id,
                checkpoint.trigger.as_str(),
                checkpoint.progress_percent,
                checkpoint.created_by,
                dt_to_ms(checkpoint.timestamp),
                checkpoint.ttl_hours,
                checkpoint.consumed,
                body
            ],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(RecoveryError::Validation(format!(
                    "checkpoint already exists: {}",
                    checkpoint.id
                )))
            }
            Err(e) => Err(map_store_err("insert checkpoint", e)),
        }
    }

    fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, RecoveryError> {
        let conn = self.conn()?;
        query_one(
            &conn,
            "SELECT body_json, consumed FROM fleet_checkpoints WHERE id = ?1",
            params![checkpoint_id],
            checkpoint_from_row,
            "read checkpoint",
        )
    }

    fn latest_checkpoint_for_mission(
        &self,
        mission_id: &str,
    ) -> Result<Option<Checkpoint>, RecoveryError> {
        let conn = self.conn()?;
        query_one(
            &conn,
            "SELECT body_json, consumed FROM fleet_checkpoints
             WHERE mission_id = ?1 AND consumed = 0
             ORDER BY created_at_ms DESC, rowid DESC
             LIMIT 1",
            params![mission_id],
            checkpoint_from_row,
            "read latest checkpoint",
        )
    }

    fn mark_checkpoint_consumed(&self, checkpoint_id: &str) -> Result<bool, RecoveryError> {
        let conn = self.conn()?;
        consume_checkpoint(&conn, checkpoint_id)
    }

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, RecoveryError> {
        let conn = self.conn()?;
        query_rows(
            &conn,
            "SELECT body_json, consumed FROM fleet_checkpoints ORDER BY created_at_ms ASC, rowid ASC",
            [],
            checkpoint_from_row,
            "list checkpoints",
        )
    }

    fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool, RecoveryError> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM fleet_checkpoints WHERE id = ?1",
                params![checkpoint_id],
            )
            .map_err(|e| map_store_err("delete checkpoint", e))?;
        Ok(deleted == 1)
    }
}

/// Restore writes on a dedicated connection holding `BEGIN IMMEDIATE`.
///
/// Dropping the connection without `COMMIT` discards the transaction, so every
/// path that does not commit leaves nothing open behind it.
struct SqliteRestoreTransaction {
    conn: Connection,
}

impl RestoreTransaction for SqliteRestoreTransaction {
    fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>, RecoveryError> {
        read_mission(&self.conn, mission_id)
    }

    fn update_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
    ) -> Result<(), RecoveryError> {
        write_mission_status(&self.conn, mission_id, status)
    }

    fn get_sortie(&self, sortie_id: &str) -> Result<Option<Sortie>, RecoveryError> {
        read_sortie(&self.conn, sortie_id)
    }

    fn update_sortie(&self, sortie: &Sortie) -> Result<(), RecoveryError> {
        write_sortie(&self.conn, sortie)
    }

    fn acquire_lock(
        &self,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition, RecoveryError> {
        with_savepoint(&self.conn, |conn| acquire_lock_on(conn, request, now))
    }

    fn force_release_lock(&self, lock_id: &str, now: DateTime<Utc>) -> Result<(), RecoveryError> {
        if release_lock_on(&self.conn, lock_id, now)? {
            Ok(())
        } else {
            Err(RecoveryError::not_found("lock", lock_id))
        }
    }

    fn requeue_message(
        &self,
        mission_id: &str,
        message: &MessageSnapshot,
    ) -> Result<(), RecoveryError> {
        upsert_message(&self.conn, &message.to_pending(mission_id))
    }

    fn mark_checkpoint_consumed(&self, checkpoint_id: &str) -> Result<bool, RecoveryError> {
        consume_checkpoint(&self.conn, checkpoint_id)
    }

    fn append_event(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        payload: EventPayload,
    ) -> Result<Event, KernelError> {
        append_event(&self.conn, stream_type, stream_id, payload)
    }

    fn commit(self: Box<Self>) -> Result<(), RecoveryError> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| RecoveryError::Transaction(format!("commit: {e}")))
    }

    fn rollback(self: Box<Self>) -> Result<(), RecoveryError> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| RecoveryError::Transaction(format!("rollback: {e}")))
    }
}

impl TransactionControl for SqliteFleetStore {
    fn begin_restore(&self) -> Result<Box<dyn RestoreTransaction + '_>, RecoveryError> {
        let conn = open_connection(&self.db_path)?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| RecoveryError::Transaction(format!("begin: {e}")))?;
        Ok(Box::new(SqliteRestoreTransaction { conn }))
    }
}

impl RestoreClaimRepository for SqliteFleetStore {
    fn try_claim_restore(
        &self,
        mission_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RecoveryError> {
        let conn = self.conn()?;
        let now_ms = dt_to_ms(now);
        let claimed = conn
            .execute(
                "INSERT INTO fleet_restore_claims (mission_id, owner, claimed_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(mission_id) DO UPDATE SET
                     owner = excluded.owner,
                     claimed_at_ms = excluded.claimed_at_ms
                 WHERE fleet_restore_claims.owner = excluded.owner
                    OR fleet_restore_claims.claimed_at_ms < ?4",
                params![mission_id, owner, now_ms, now_ms - RESTORE_CLAIM_STALE_MS],
            )
            .map_err(|e| map_store_err("claim restore", e))?;
        Ok(claimed == 1)
    }

    fn release_restore(&self, mission_id: &str, owner: &str) -> Result<(), RecoveryError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM fleet_restore_claims WHERE mission_id = ?1 AND owner = ?2",
            params![mission_id, owner],
        )
        .map_err(|e| map_store_err("release restore claim", e))?;
        Ok(())
    }
}

impl EventStore for SqliteFleetStore {
    fn append(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        payload: EventPayload,
    ) -> Result<Event, KernelError> {
        let conn = self.conn_kernel()?;
        append_event(&conn, stream_type, stream_id, payload)
    }

    fn query(&self, stream_id: &str, query: &EventQuery) -> Result<Vec<Event>, KernelError> {
        let conn = self.conn_kernel()?;
        query_events(&conn, stream_id, query)
    }

    fn get_latest(&self, stream_id: &str) -> Result<Option<Event>, KernelError> {
        let conn = self.conn_kernel()?;
        latest_event(&conn, stream_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use chrono::Duration;
    use fleet_kernel::MissionStartedData;

    use super::*;
    use crate::test_support::{checkpoint, mission, sortie};

    fn test_db_path(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("fleet-recovery-{name}-{ts}.sqlite"))
    }

    fn request(file: &str, holder: &str, timeout_ms: u64) -> LockRequest {
        LockRequest {
            file: file.into(),
            held_by: holder.into(),
            mission_id: Some("m1".into()),
            purpose: "edit".into(),
            timeout_ms,
        }
    }

    #[test]
    fn missions_and_sorties_roundtrip() {
        let store = SqliteFleetStore::open(test_db_path("roundtrip")).unwrap();
        store.insert_mission(mission("m1", 2, 1)).unwrap();
        store
            .insert_sortie(sortie("s1", "m1", SortieStatus::Completed, &["a.ts", "b.ts"]))
            .unwrap();
        store
            .insert_sortie(sortie("s2", "m1", SortieStatus::Pending, &[]))
            .unwrap();

        let loaded = store.get_mission("m1").unwrap().unwrap();
        assert_eq!(loaded.status, MissionStatus::InProgress);
        assert_eq!(loaded.total_sorties, 2);
        let sorties = store.sorties_by_mission("m1").unwrap();
        assert_eq!(sorties.len(), 2);
        assert_eq!(sorties[0].files, vec!["a.ts".to_string(), "b.ts".to_string()]);

        store
            .update_mission_status("m1", MissionStatus::Blocked)
            .unwrap();
        assert_eq!(
            store.missions_by_status(MissionStatus::Blocked).unwrap().len(),
            1
        );
        assert!(store
            .update_mission_status("missing", MissionStatus::Blocked)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn lock_conflicts_refreshes_and_expiry() {
        let store = SqliteFleetStore::open(test_db_path("locks")).unwrap();
        let now = Utc::now();
        let LockAcquisition::Acquired(first) = store
            .acquire_lock(&request("a.ts", "alice", 1_000), now)
            .unwrap()
        else {
            panic!("expected acquisition");
        };
        assert!(matches!(
            store.acquire_lock(&request("a.ts", "bob", 1_000), now).unwrap(),
            LockAcquisition::Conflict(ref l) if l.held_by == "alice"
        ));
        let LockAcquisition::Acquired(refreshed) = store
            .acquire_lock(&request("a.ts", "alice", 5_000), now)
            .unwrap()
        else {
            panic!("expected refresh");
        };
        assert_eq!(refreshed.id, first.id);
        assert_eq!(refreshed.timeout_ms, 5_000);

        let later = now + Duration::milliseconds(5_001);
        assert!(matches!(
            store.acquire_lock(&request("a.ts", "bob", 1_000), later).unwrap(),
            LockAcquisition::Acquired(ref l) if l.held_by == "bob"
        ));
        let active = store.active_lock_for_file("a.ts").unwrap().unwrap();
        assert_eq!(active.held_by, "bob");
        store.force_release_lock(&active.id, later).unwrap();
        assert!(store.active_lock_for_file("a.ts").unwrap().is_none());
        assert!(store.force_release_lock(&active.id, later).is_err());
    }

    #[test]
    fn checkpoint_consumed_exactly_once() {
        let store = SqliteFleetStore::open(test_db_path("checkpoints")).unwrap();
        let now = Utc::now();
        store
            .create_checkpoint(&checkpoint("c1", "m1", now - Duration::minutes(5)))
            .unwrap();
        store.create_checkpoint(&checkpoint("c2", "m1", now)).unwrap();
        assert!(matches!(
            store.create_checkpoint(&checkpoint("c2", "m1", now)),
            Err(RecoveryError::Validation(_))
        ));

        let latest = store.latest_checkpoint_for_mission("m1").unwrap().unwrap();
        assert_eq!(latest.id, "c2");
        assert_eq!(latest.timestamp, now);

        assert!(store.mark_checkpoint_consumed("c2").unwrap());
        assert!(!store.mark_checkpoint_consumed("c2").unwrap());
        assert!(store.get_checkpoint("c2").unwrap().unwrap().consumed);
        assert_eq!(
            store.latest_checkpoint_for_mission("m1").unwrap().unwrap().id,
            "c1"
        );
        assert!(store.mark_checkpoint_consumed("nope").is_err());

        assert_eq!(store.list_checkpoints().unwrap().len(), 2);
        assert!(store.delete_checkpoint("c1").unwrap());
        assert!(!store.delete_checkpoint("c1").unwrap());
    }

    fn started(mission_id: &str) -> EventPayload {
        EventPayload::MissionStarted(MissionStartedData {
            mission_id: mission_id.into(),
            title: "x".into(),
        })
    }

    #[test]
    fn rollback_discards_transaction_writes_and_events() {
        let store = SqliteFleetStore::open(test_db_path("rollback")).unwrap();
        store.insert_mission(mission("m1", 1, 0)).unwrap();
        store
            .insert_sortie(sortie("s1", "m1", SortieStatus::Pending, &[]))
            .unwrap();

        let tx = store.begin_restore().unwrap();
        let mut s1 = tx.get_sortie("s1").unwrap().unwrap();
        s1.status = SortieStatus::Completed;
        tx.update_sortie(&s1).unwrap();
        tx.append_event(StreamType::Mission, "m1", started("m1"))
            .unwrap();
        tx.rollback().unwrap();

        assert_eq!(
            store.get_sortie("s1").unwrap().unwrap().status,
            SortieStatus::Pending
        );
        assert_eq!(store.head("m1").unwrap(), 0);
    }

    #[test]
    fn store_writes_during_a_restore_survive_its_rollback() {
        let store = SqliteFleetStore::open(test_db_path("rollback-isolation")).unwrap();
        store
            .insert_sortie(sortie("s1", "m1", SortieStatus::Pending, &[]))
            .unwrap();
        let tx = store.begin_restore().unwrap();
        tx.update_sortie(&sortie("s1", "m1", SortieStatus::Completed, &[]))
            .unwrap();

        let other = store.clone();
        let writer = std::thread::spawn(move || {
            other
                .create_checkpoint(&checkpoint("cp-m2", "m2", Utc::now()))
                .unwrap();
            other.append(StreamType::Mission, "m2", started("m2")).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(100));
        tx.rollback().unwrap();
        writer.join().unwrap();

        assert!(store.get_checkpoint("cp-m2").unwrap().is_some());
        assert_eq!(store.head("m2").unwrap(), 1);
        assert_eq!(
            store.get_sortie("s1").unwrap().unwrap().status,
            SortieStatus::Pending
        );
    }

    #[test]
    fn abandoned_transaction_leaves_nothing_open() {
        let store = SqliteFleetStore::open(test_db_path("abandoned")).unwrap();
        store.insert_mission(mission("m1", 1, 0)).unwrap();
        {
            let tx = store.begin_restore().unwrap();
            tx.update_mission_status("m1", MissionStatus::Blocked)
                .unwrap();
        }
        assert_eq!(
            store.get_mission("m1").unwrap().unwrap().status,
            MissionStatus::InProgress
        );

        let tx = store.begin_restore().unwrap();
        tx.update_mission_status("m1", MissionStatus::Completed)
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(
            store.get_mission("m1").unwrap().unwrap().status,
            MissionStatus::Completed
        );
    }

    #[test]
    fn restore_claims_are_shared_across_connections() {
        let path = test_db_path("claims");
        let a = SqliteFleetStore::open(&path).unwrap();
        let b = SqliteFleetStore::open(&path).unwrap();
        let now = Utc::now();
        assert!(a.try_claim_restore("m1", "proc-a", now).unwrap());
        assert!(!b.try_claim_restore("m1", "proc-b", now).unwrap());
        assert!(a.try_claim_restore("m1", "proc-a", now).unwrap());
        let stale = now + Duration::milliseconds(RESTORE_CLAIM_STALE_MS + 1);
        assert!(b.try_claim_restore("m1", "proc-b", stale).unwrap());
        b.release_restore("m1", "proc-b").unwrap();
        assert!(a.try_claim_restore("m1", "proc-a", stale).unwrap());
    }

    #[test]
    fn messages_requeue_and_ack() {
        let store = SqliteFleetStore::open(test_db_path("messages")).unwrap();
        let sent_at = Utc::now();
        store
            .send_message(Message {
                id: "msg-1".into(),
                mission_id: "m1".into(),
                sender: "alice".into(),
                recipient: "bob".into(),
                subject: "handoff".into(),
                payload: serde_json::json!({"file": "a.ts"}),
                sent_at,
                delivered: false,
            })
            .unwrap();
        let pending = store.pending_messages("m1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["file"], "a.ts");

        let snapshot = MessageSnapshot::from(&pending[0]);
        assert!(store.ack_message("msg-1").unwrap());
        assert!(store.pending_messages("m1").unwrap().is_empty());
        store.requeue_message("m1", &snapshot).unwrap();
        assert!(!store.get_message("msg-1").unwrap().unwrap().delivered);
    }
}
