//! Recovery narrative: the human and LLM readable part of a checkpoint.
//!
//! One classification rule serves both checkpoint creation and restore: a sortie
//! is blocked iff its status is `blocked`. Progress notes are shown but never
//! parsed.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use fleet_kernel::Event;

use crate::models::{age_ms, BlockerInfo, Mission, RecoveryContext, SortieSnapshot, SortieStatus};

pub const FALLBACK_NEXT_STEP: &str = "Review mission status and continue";

/// Priority-ordered next steps: in-progress, then blocked, then pending sorties.
pub fn next_steps(sorties: &[SortieSnapshot]) -> Vec<String> {
    let mut steps = Vec::new();
    for s in sorties.iter().filter(|s| s.status == SortieStatus::InProgress) {
        steps.push(match &s.progress_notes {
            Some(notes) => format!(
                "Continue work on sortie '{}' ({}, {}%): {}",
                s.title, s.id, s.progress, notes
            ),
            None => format!(
                "Continue work on sortie '{}' ({}, {}%)",
                s.title, s.id, s.progress
            ),
        });
    }
    for s in sorties.iter().filter(|s| s.status == SortieStatus::Blocked) {
        steps.push(format!("Resolve blockers on sortie '{}' ({})", s.title, s.id));
    }
    for s in sorties.iter().filter(|s| s.status == SortieStatus::Pending) {
        steps.push(format!("Start pending sortie '{}' ({})", s.title, s.id));
    }
    if steps.is_empty() {
        steps.push(FALLBACK_NEXT_STEP.to_string());
    }
    steps
}

/// Union of every file touched by the snapshots, sorted.
pub fn files_modified(sorties: &[SortieSnapshot]) -> Vec<String> {
    sorties
        .iter()
        .flat_map(|s| s.files.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn mission_summary(mission: &Mission, sorties: &[SortieSnapshot]) -> String {
    let count = |status: SortieStatus| sorties.iter().filter(|s| s.status == status).count();
    format!(
        "Mission '{}' is {} with {}/{} sorties complete ({} in progress, {} blocked, {} pending)",
        mission.title,
        mission.status.as_str(),
        mission.completed_sorties,
        mission.total_sorties,
        count(SortieStatus::InProgress),
        count(SortieStatus::Blocked),
        count(SortieStatus::Pending),
    )
}

/// Builds the context stored with a new checkpoint.
///
/// `latest_event` is the newest entry of the mission's stream; without one the
/// mission's own timestamps stand in for activity.
pub fn build_recovery_context(
    mission: &Mission,
    sorties: &[SortieSnapshot],
    latest_event: Option<&Event>,
    blockers: Vec<BlockerInfo>,
    now: DateTime<Utc>,
) -> RecoveryContext {
    let (last_action, last_activity_at) = match latest_event {
        Some(event) => (event.payload.describe(), event.occurred_at),
        None => ("Mission created".to_string(), mission.active_since()),
    };
    RecoveryContext {
        last_action,
        next_steps: next_steps(sorties),
        blockers,
        files_modified: files_modified(sorties),
        mission_summary: mission_summary(mission, sorties),
        elapsed_time_ms: age_ms(mission.active_since(), now),
        last_activity_at,
    }
}

/// Adds blockers discovered while restoring and a step asking to resolve them.
pub fn with_restore_blockers(
    mut context: RecoveryContext,
    restore_blockers: Vec<BlockerInfo>,
) -> RecoveryContext {
    if restore_blockers.is_empty() {
        return context;
    }
    context.next_steps.insert(
        0,
        format!("Resolve {} restore blocker(s)", restore_blockers.len()),
    );
    context.blockers.extend(restore_blockers);
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockerType, Sortie};
    use crate::test_support::{mission, sortie};

    fn snap(sortie: Sortie) -> SortieSnapshot {
        SortieSnapshot::from(&sortie)
    }

    #[test]
    fn steps_follow_priority_order() {
        let mut noted = sortie("s3", "m1", SortieStatus::InProgress, &[]);
        noted.progress_notes = Some("blocked on review".into());
        let sorties = vec![
            snap(sortie("s1", "m1", SortieStatus::Pending, &[])),
            snap(sortie("s2", "m1", SortieStatus::Blocked, &[])),
            snap(noted),
        ];
        let steps = next_steps(&sorties);
        assert_eq!(steps.len(), 3);
        assert!(steps[0].starts_with("Continue work on sortie 'Sortie s3'"));
        assert!(steps[0].ends_with("blocked on review"));
        assert!(steps[1].starts_with("Resolve blockers"));
        assert!(steps[2].starts_with("Start pending"));
    }

    #[test]
    fn completed_mission_falls_back() {
        let sorties = vec![snap(sortie("s1", "m1", SortieStatus::Completed, &["a.ts"]))];
        assert_eq!(next_steps(&sorties), vec![FALLBACK_NEXT_STEP.to_string()]);
    }

    #[test]
    fn context_uses_mission_times_without_events() {
        let m = mission("m1", 2, 1);
        let sorties = vec![
            snap(sortie("s1", "m1", SortieStatus::Completed, &["b.ts", "a.ts"])),
            snap(sortie("s2", "m1", SortieStatus::InProgress, &["a.ts"])),
        ];
        let now = Utc::now();
        let ctx = build_recovery_context(&m, &sorties, None, Vec::new(), now);
        assert_eq!(ctx.last_action, "Mission created");
        assert_eq!(ctx.last_activity_at, m.active_since());
        assert_eq!(ctx.files_modified, vec!["a.ts".to_string(), "b.ts".to_string()]);
        assert!(ctx.elapsed_time_ms >= 3_600_000);
        assert!(ctx.mission_summary.contains("1/2 sorties complete"));
    }

    #[test]
    fn restore_blockers_prepend_a_step() {
        let m = mission("m1", 1, 0);
        let ctx = build_recovery_context(&m, &[], None, Vec::new(), Utc::now());
        let blocker = BlockerInfo::new(BlockerType::LockTimeout, "expired", Utc::now());
        let ctx = with_restore_blockers(ctx, vec![blocker]);
        assert_eq!(ctx.next_steps[0], "Resolve 1 restore blocker(s)");
        assert_eq!(ctx.blockers.len(), 1);
    }
}
