//! Crash recovery for long-running fleet missions.
//!
//! Checkpoints snapshot a mission's sorties, file locks and undelivered
//! messages. Inactivity detection finds missions that went quiet, and the state
//! restorer writes a checkpoint back into live state inside one transaction,
//! returning a narrative a resumed specialist can pick up from.
//!
//! Live state is owned by the surrounding coordination layer and reached only
//! through the traits in [repository]; the event log comes from `fleet-kernel`.

pub mod checkpoint;
pub mod cleanup;
pub mod config;
pub mod contract;
pub mod detection;
pub mod error;
pub mod memory_repository;
pub mod models;
pub mod narrative;
pub mod periodic;
pub mod repository;
pub mod restore;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_repository;
pub mod triggers;

#[cfg(test)]
mod test_support;

pub use checkpoint::{
    CheckpointCoordinator, CheckpointCreator, CheckpointOptions, DEFAULT_CHECKPOINT_TTL_HOURS,
};
pub use cleanup::{
    run_cleanup, CheckpointCleanupService, CleanupConfig, CleanupReport, CleanupStats,
    CLEANUP_STREAM_ID,
};
pub use config::{RecoveryConfig, StoreBackend};
pub use contract::{generate_wire_contract, wire_contract_pretty_json, WireContract};
pub use detection::{
    last_activity, scan_inactive, DetectionOptions, InactivityAlert, InactivityConfig,
    InactivityDetector, InactivityHandler, InactivityMonitor, InactivityStatus, RecoveryCheck,
    RecoveryDetector, DEFAULT_INACTIVITY_THRESHOLD_MS, DEFAULT_MONITOR_INTERVAL_MS,
};
pub use error::RecoveryError;
pub use memory_repository::InMemoryFleetStore;
pub use models::{
    BlockerInfo, BlockerType, Checkpoint, CheckpointTrigger, Lock, LockAcquisition, LockRequest,
    LockSnapshot, Message, MessageSnapshot, Mission, MissionStatus, RecoveryCandidate,
    RecoveryContext, Sortie, SortieSnapshot, SortieStatus,
};
pub use periodic::PeriodicTask;
pub use repository::{
    CheckpointRepository, FleetStore, LockRepository, MessageRepository, MissionRepository,
    RestoreClaimRepository, RestoreTransaction, SortieRepository, TransactionControl,
    RESTORE_CLAIM_STALE_MS,
};
pub use restore::{
    format_recovery_prompt, RecoveryResult, RestoreOptions, RestorePhase, RestoredCounts,
    RollbackOutcome, StateRestorer, LOCK_CONFLICT_CODE,
};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_repository::SqliteFleetStore;
pub use triggers::{ErrorTrigger, ErrorTriggerConfig, ProgressTrigger, ProgressTriggerConfig};
