#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use fleet_kernel::{EventPayload, EventStore, MissionStartedData, StreamType};
use fleet_recovery::{
    Checkpoint, CheckpointCoordinator, CheckpointCreator, ErrorTriggerConfig, InMemoryFleetStore,
    LockAcquisition, LockRepository, LockRequest, Message, Mission, MissionStatus,
    ProgressTriggerConfig, Sortie, SortieStatus,
};

pub const SPECIALIST: &str = "specialist-1";
pub const OTHER_SPECIALIST: &str = "specialist-2";
pub const HOUR_MS: u64 = 60 * 60 * 1000;

pub fn mission(id: &str, total: u32, completed: u32, now: DateTime<Utc>) -> Mission {
    Mission {
        id: id.to_string(),
        title: format!("Refactor module {id}"),
        status: MissionStatus::InProgress,
        total_sorties: total,
        completed_sorties: completed,
        created_at: now - Duration::hours(2),
        started_at: Some(now - Duration::hours(2)),
    }
}

pub fn sortie(id: &str, mission_id: &str, status: SortieStatus, files: &[&str]) -> Sortie {
    Sortie {
        id: id.to_string(),
        mission_id: mission_id.to_string(),
        title: format!("Sortie {id}"),
        status,
        assigned_to: Some(SPECIALIST.to_string()),
        files: files.iter().map(|f| f.to_string()).collect(),
        progress: if status == SortieStatus::Completed { 100 } else { 0 },
        progress_notes: None,
    }
}

pub fn lock_request(file: &str, holder: &str, mission_id: Option<&str>, timeout_ms: u64) -> LockRequest {
    LockRequest {
        file: file.to_string(),
        held_by: holder.to_string(),
        mission_id: mission_id.map(str::to_string),
        purpose: "edit".to_string(),
        timeout_ms,
    }
}

pub fn message(id: &str, mission_id: &str, now: DateTime<Utc>) -> Message {
    Message {
        id: id.to_string(),
        mission_id: mission_id.to_string(),
        sender: SPECIALIST.to_string(),
        recipient: "coordinator".to_string(),
        subject: "review request".to_string(),
        payload: json!({"files": ["a.ts"]}),
        sent_at: now - Duration::minutes(5),
        delivered: false,
    }
}

pub fn acquire(store: &impl LockRepository, request: &LockRequest, now: DateTime<Utc>) {
    match store.acquire_lock(request, now).unwrap() {
        LockAcquisition::Acquired(_) => {}
        LockAcquisition::Conflict(held) => panic!("unexpected conflict with {}", held.held_by),
    }
}

pub fn coordinator(store: InMemoryFleetStore) -> CheckpointCoordinator<InMemoryFleetStore> {
    CheckpointCoordinator::new(
        CheckpointCreator::new(store),
        ProgressTriggerConfig::default(),
        ErrorTriggerConfig::default(),
    )
}

/// Mission m1 with four sorties, two of them done, and a lock on a.ts held
/// by the assigned specialist.
pub fn seed_mission(store: &InMemoryFleetStore, now: DateTime<Utc>) {
    store.insert_mission(mission("m1", 4, 2, now)).unwrap();
    store
        .insert_sortie(sortie("s1", "m1", SortieStatus::Completed, &["a.ts"]))
        .unwrap();
    store
        .insert_sortie(sortie("s2", "m1", SortieStatus::Completed, &["b.ts"]))
        .unwrap();
    store
        .insert_sortie(sortie("s3", "m1", SortieStatus::Pending, &["a.ts", "c.ts"]))
        .unwrap();
    store
        .insert_sortie(sortie("s4", "m1", SortieStatus::Pending, &[]))
        .unwrap();
    store
        .append(
            StreamType::Mission,
            "m1",
            EventPayload::MissionStarted(MissionStartedData {
                mission_id: "m1".to_string(),
                title: "Refactor module m1".to_string(),
            }),
        )
        .unwrap();
    acquire(store, &lock_request("a.ts", SPECIALIST, Some("m1"), HOUR_MS), now);
}

/// Seeds m1 and takes the 50% progress checkpoint.
pub fn checkpointed_mission(now: DateTime<Utc>) -> (InMemoryFleetStore, Checkpoint) {
    let store = InMemoryFleetStore::new();
    seed_mission(&store, now);
    let checkpoint = coordinator(store.clone())
        .on_progress_at("m1", 50, SPECIALIST, now)
        .expect("progress checkpoint at 50%");
    (store, checkpoint)
}
