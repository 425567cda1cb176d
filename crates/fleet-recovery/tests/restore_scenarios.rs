mod common;

use chrono::{Duration, Utc};

use common::*;
use fleet_kernel::{EventPayload, EventQuery, EventStore, EventType};
use fleet_recovery::{
    BlockerType, CheckpointRepository, CheckpointTrigger, InMemoryFleetStore, LockRepository,
    MessageRepository, RestoreClaimRepository, RestoreOptions, RestoredCounts, RollbackOutcome,
    SortieRepository, SortieStatus, StateRestorer,
};

fn release_live_lock(store: &InMemoryFleetStore, file: &str, at: chrono::DateTime<Utc>) {
    let lock = store.active_lock_for_file(file).unwrap().expect("live lock");
    assert!(store.release_lock(&lock.id, at).unwrap());
}

#[test]
fn crash_and_restore_round_trip() {
    let now = Utc::now();
    let (store, checkpoint) = checkpointed_mission(now);

    assert_eq!(checkpoint.trigger, CheckpointTrigger::Progress);
    assert_eq!(checkpoint.progress_percent, 50);
    let completed = checkpoint
        .sorties
        .iter()
        .filter(|s| s.status == SortieStatus::Completed)
        .count();
    let pending = checkpoint
        .sorties
        .iter()
        .filter(|s| s.status == SortieStatus::Pending)
        .count();
    assert_eq!((completed, pending), (2, 2));
    assert_eq!(checkpoint.active_locks.len(), 1);
    assert_eq!(checkpoint.active_locks[0].file, "a.ts");

    // Crash: the lock is reaped and a sortie is left half-updated.
    let later = now + Duration::minutes(10);
    release_live_lock(&store, "a.ts", later);
    let mut s3 = store.get_sortie("s3").unwrap().unwrap();
    s3.status = SortieStatus::InProgress;
    s3.progress = 30;
    store.update_sortie(&s3).unwrap();
    let head = store.head("m1").unwrap();

    let restorer = StateRestorer::new(store.clone());
    let result = restorer
        .restore_from_checkpoint_at(&checkpoint.id, RestoreOptions::default(), later)
        .unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(
        result.restored,
        RestoredCounts {
            sorties: 4,
            locks: 1,
            messages: 0
        }
    );
    assert_eq!(result.event_sequence, Some(head + 1));
    assert_eq!(result.rollback, RollbackOutcome::NotNeeded);

    assert!(store.get_checkpoint(&checkpoint.id).unwrap().unwrap().consumed);
    let s3 = store.get_sortie("s3").unwrap().unwrap();
    assert_eq!(s3.status, SortieStatus::Pending);
    assert_eq!(s3.progress, 0);
    let lock = store.active_lock_for_file("a.ts").unwrap().unwrap();
    assert_eq!(lock.held_by, SPECIALIST);
    assert_eq!(lock.timeout_ms, HOUR_MS);
    assert_eq!(lock.acquired_at, later);

    let latest = store.get_latest("m1").unwrap().unwrap();
    assert_eq!(latest.sequence, head + 1);
    match latest.payload {
        EventPayload::FleetRecovered(data) => {
            assert_eq!(data.checkpoint_id, checkpoint.id);
            assert_eq!(data.sorties_restored, 4);
            assert_eq!(data.locks_restored, 1);
            assert_eq!(data.messages_requeued, 0);
            assert_eq!(data.warnings, 0);
        }
        other => panic!("unexpected latest event {:?}", other.event_type()),
    }

    // A second restore of the same checkpoint must not apply anything.
    let again = restorer
        .restore_from_checkpoint_at(&checkpoint.id, RestoreOptions::default(), later)
        .unwrap();
    assert!(!again.success);
    assert!(again.errors[0].contains("already consumed"));
    assert_eq!(store.head("m1").unwrap(), head + 1);
    assert!(store
        .latest_checkpoint_for_mission("m1")
        .unwrap()
        .is_none());
}

#[test]
fn lock_conflict_is_a_warning_without_force() {
    let now = Utc::now();
    let (store, checkpoint) = checkpointed_mission(now);
    let later = now + Duration::minutes(5);
    release_live_lock(&store, "a.ts", later);
    acquire(&store, &lock_request("a.ts", OTHER_SPECIALIST, None, HOUR_MS), later);

    let result = StateRestorer::new(store.clone())
        .restore_from_checkpoint_at(&checkpoint.id, RestoreOptions::default(), later)
        .unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.restored.locks, 0);
    assert_eq!(result.restored.sorties, 4);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("a.ts"));

    let ctx = result.recovery_context.unwrap();
    assert!(ctx
        .blockers
        .iter()
        .any(|b| b.blocker_type == BlockerType::Dependency && b.description.contains("a.ts")));
    assert_eq!(ctx.next_steps[0], "Resolve 1 restore blocker(s)");
    let holder = store.active_lock_for_file("a.ts").unwrap().unwrap();
    assert_eq!(holder.held_by, OTHER_SPECIALIST);
}

#[test]
fn force_locks_takes_the_file_back() {
    let now = Utc::now();
    let (store, checkpoint) = checkpointed_mission(now);
    let later = now + Duration::minutes(5);
    release_live_lock(&store, "a.ts", later);
    acquire(&store, &lock_request("a.ts", OTHER_SPECIALIST, None, HOUR_MS), later);

    let result = StateRestorer::new(store.clone())
        .restore_from_checkpoint_at(&checkpoint.id, RestoreOptions::force_locks(), later)
        .unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.restored.locks, 1);
    let holder = store.active_lock_for_file("a.ts").unwrap().unwrap();
    assert_eq!(holder.held_by, SPECIALIST);

    let released = store
        .query("a.ts", &EventQuery::new().with_type(EventType::LockReleased))
        .unwrap();
    assert_eq!(released.len(), 1);
    match &released[0].payload {
        EventPayload::LockReleased(data) => {
            assert!(data.forced);
            assert_eq!(data.held_by, OTHER_SPECIALIST);
        }
        other => panic!("unexpected event {:?}", other.event_type()),
    }
}

#[test]
fn dry_run_matches_live_counts_and_changes_nothing() {
    let now = Utc::now();
    let store = InMemoryFleetStore::new();
    seed_mission(&store, now);
    store.send_message(message("msg-1", "m1", now)).unwrap();
    let checkpoint = coordinator(store.clone())
        .on_progress_at("m1", 50, SPECIALIST, now)
        .unwrap();
    assert_eq!(checkpoint.pending_messages.len(), 1);

    let later = now + Duration::minutes(5);
    assert!(store.ack_message("msg-1").unwrap());
    release_live_lock(&store, "a.ts", later);

    let sorties_before = store.sorties_by_mission("m1").unwrap();
    let locks_before = store.all_locks().unwrap();
    let head_before = store.head("m1").unwrap();

    let restorer = StateRestorer::new(store.clone());
    let preview = restorer
        .restore_from_checkpoint_at(&checkpoint.id, RestoreOptions::dry_run(), later)
        .unwrap();
    assert!(preview.success);
    assert!(preview.dry_run);
    assert_eq!(preview.event_sequence, None);

    assert_eq!(store.sorties_by_mission("m1").unwrap(), sorties_before);
    assert_eq!(store.all_locks().unwrap(), locks_before);
    assert!(store.pending_messages("m1").unwrap().is_empty());
    assert_eq!(store.head("m1").unwrap(), head_before);
    assert!(!store.get_checkpoint(&checkpoint.id).unwrap().unwrap().consumed);

    let live = restorer
        .restore_from_checkpoint_at(&checkpoint.id, RestoreOptions::default(), later)
        .unwrap();
    assert!(live.success, "{:?}", live.errors);
    assert_eq!(preview.restored, live.restored);
    assert_eq!(
        live.restored,
        RestoredCounts {
            sorties: 4,
            locks: 1,
            messages: 1
        }
    );
    let pending = store.pending_messages("m1").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "msg-1");
}

#[test]
fn expired_lock_is_never_reacquired() {
    let now = Utc::now();
    let store = InMemoryFleetStore::new();
    store.insert_mission(mission("m1", 1, 0, now)).unwrap();
    store
        .insert_sortie(sortie("s1", "m1", SortieStatus::InProgress, &["slow.ts"]))
        .unwrap();
    acquire(
        &store,
        &lock_request("slow.ts", SPECIALIST, Some("m1"), 1_000),
        now - Duration::seconds(30),
    );
    let checkpoint = coordinator(store.clone())
        .manual("m1", SPECIALIST, Some("before shutdown".to_string()))
        .unwrap();
    assert_eq!(checkpoint.active_locks.len(), 1);

    let result = StateRestorer::new(store.clone())
        .restore_from_checkpoint_at(&checkpoint.id, RestoreOptions::force_locks(), now)
        .unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.restored.locks, 0);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("slow.ts"));
    let ctx = result.recovery_context.unwrap();
    assert!(ctx
        .blockers
        .iter()
        .any(|b| b.blocker_type == BlockerType::LockTimeout));
}

#[test]
fn concurrent_restore_is_rejected_while_claim_is_held() {
    let now = Utc::now();
    let (store, checkpoint) = checkpointed_mission(now);
    assert!(store.try_claim_restore("m1", "other-process", now).unwrap());

    let restorer = StateRestorer::with_owner(store.clone(), "this-process");
    let rejected = restorer
        .restore_latest_at("m1", RestoreOptions::default(), now)
        .unwrap();
    assert!(!rejected.success);
    assert!(rejected.errors[0].contains("restore already in progress"));

    store.release_restore("m1", "other-process").unwrap();
    let accepted = restorer
        .restore_latest_at("m1", RestoreOptions::default(), now)
        .unwrap();
    assert!(accepted.success, "{:?}", accepted.errors);
    assert_eq!(accepted.checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));
    // The claim is released once the restore finishes.
    assert!(store.try_claim_restore("m1", "third-process", now).unwrap());
}
