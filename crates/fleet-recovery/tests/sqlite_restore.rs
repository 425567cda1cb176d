#![cfg(feature = "sqlite-persistence")]

mod common;

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Duration, Utc};

use common::*;
use fleet_kernel::{EventPayload, EventStore, MissionStartedData, StreamType};
use fleet_recovery::{
    CheckpointCreator, CheckpointOptions, CheckpointRepository, CheckpointTrigger,
    LockRepository, RestoreClaimRepository, RestoreOptions, RestoredCounts, SortieRepository,
    SortieStatus, SqliteFleetStore, StateRestorer,
};

fn test_db_path(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("fleet-recovery-it-{name}-{ts}.sqlite"))
}

fn seeded(path: &PathBuf) -> SqliteFleetStore {
    let now = Utc::now();
    let store = SqliteFleetStore::open(path.clone()).unwrap();
    store.insert_mission(mission("m1", 4, 2, now)).unwrap();
    for (id, status) in [
        ("s1", SortieStatus::Completed),
        ("s2", SortieStatus::Completed),
        ("s3", SortieStatus::Pending),
        ("s4", SortieStatus::Pending),
    ] {
        store.insert_sortie(sortie(id, "m1", status, &["a.ts"])).unwrap();
    }
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
    acquire(&store, &lock_request("a.ts", SPECIALIST, Some("m1"), HOUR_MS), now);
    store.send_message(message("msg-1", "m1", now)).unwrap();
    store
}

#[test]
fn restore_round_trip_on_sqlite() {
    let path = test_db_path("roundtrip");
    let store = seeded(&path);
    let checkpoint = CheckpointCreator::new(store.clone())
        .create_checkpoint(
            "m1",
            CheckpointTrigger::Manual,
            CheckpointOptions::new(SPECIALIST).with_details("before deploy"),
        )
        .unwrap();

    // Crash aftermath seen through a second handle on the same file.
    let other = SqliteFleetStore::open(path.clone()).unwrap();
    let lock = other.active_lock_for_file("a.ts").unwrap().unwrap();
    assert!(other.release_lock(&lock.id, Utc::now()).unwrap());
    assert!(other.ack_message("msg-1").unwrap());
    let mut s4 = other.get_sortie("s4").unwrap().unwrap();
    s4.status = SortieStatus::Blocked;
    other.update_sortie(&s4).unwrap();
    let head = other.head("m1").unwrap();

    let result = StateRestorer::new(other.clone())
        .restore_from_checkpoint(&checkpoint.id, RestoreOptions::default())
        .unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(
        result.restored,
        RestoredCounts {
            sorties: 4,
            locks: 1,
            messages: 1
        }
    );
    assert_eq!(result.event_sequence, Some(head + 1));

    assert!(store.get_checkpoint(&checkpoint.id).unwrap().unwrap().consumed);
    assert_eq!(
        store.get_sortie("s4").unwrap().unwrap().status,
        SortieStatus::Pending
    );
    assert_eq!(
        store.active_lock_for_file("a.ts").unwrap().unwrap().held_by,
        SPECIALIST
    );
    let _ = std::fs::remove_file(path);
}

#[test]
fn claim_is_shared_between_handles() {
    let path = test_db_path("claim");
    let store = seeded(&path);
    let checkpoint = CheckpointCreator::new(store.clone())
        .create_checkpoint(
            "m1",
            CheckpointTrigger::Manual,
            CheckpointOptions::new(SPECIALIST),
        )
        .unwrap();
    let now = Utc::now();
    assert!(store.try_claim_restore("m1", "process-a", now).unwrap());

    let other = SqliteFleetStore::open(path.clone()).unwrap();
    let rejected = StateRestorer::with_owner(other.clone(), "process-b")
        .restore_from_checkpoint_at(&checkpoint.id, RestoreOptions::default(), now)
        .unwrap();
    assert!(!rejected.success);
    assert!(rejected.errors[0].contains("restore already in progress"));

    // An abandoned claim is taken over once it is stale.
    let much_later = now + Duration::minutes(11);
    let taken_over = StateRestorer::with_owner(other, "process-b")
        .restore_from_checkpoint_at(&checkpoint.id, RestoreOptions::default(), much_later)
        .unwrap();
    assert!(taken_over.success, "{:?}", taken_over.errors);
    let _ = std::fs::remove_file(path);
}
