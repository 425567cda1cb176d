//! Fixtures shared by unit tests.

use chrono::{DateTime, Duration, Utc};

use crate::models::{
    Checkpoint, CheckpointTrigger, Mission, MissionStatus, RecoveryContext, Sortie, SortieStatus,
};

pub fn mission(id: &str, total: u32, completed: u32) -> Mission {
    let created = Utc::now() - Duration::hours(1);
    Mission {
        id: id.to_string(),
        title: format!("Mission {id}"),
        status: MissionStatus::InProgress,
        total_sorties: total,
        completed_sorties: completed,
        created_at: created,
        started_at: Some(created),
    }
}

pub fn sortie(id: &str, mission_id: &str, status: SortieStatus, files: &[&str]) -> Sortie {
    Sortie {
        id: id.to_string(),
        mission_id: mission_id.to_string(),
        title: format!("Sortie {id}"),
        status,
        assigned_to: Some("specialist-1".to_string()),
        files: files.iter().map(|f| f.to_string()).collect(),
        progress: match status {
            SortieStatus::Completed => 100,
            SortieStatus::Pending => 0,
            _ => 50,
        },
        progress_notes: None,
    }
}

pub fn checkpoint(id: &str, mission_id: &str, timestamp: DateTime<Utc>) -> Checkpoint {
    Checkpoint {
        id: id.to_string(),
        mission_id: mission_id.to_string(),
        trigger: CheckpointTrigger::Manual,
        trigger_details: None,
        progress_percent: 0,
        created_by: "test".to_string(),
        timestamp,
        sorties: Vec::new(),
        active_locks: Vec::new(),
        pending_messages: Vec::new(),
        recovery_context: RecoveryContext {
            last_action: "Mission created".to_string(),
            next_steps: Vec::new(),
            blockers: Vec::new(),
            files_modified: Vec::new(),
            mission_summary: String::new(),
            elapsed_time_ms: 0,
            last_activity_at: timestamp,
        },
        ttl_hours: 168,
        consumed: false,
    }
}
