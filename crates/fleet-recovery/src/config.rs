//! Environment configuration for the recovery services.

use std::collections::HashMap;
use std::str::FromStr;

use crate::checkpoint::{CheckpointCoordinator, CheckpointCreator, DEFAULT_CHECKPOINT_TTL_HOURS};
use crate::cleanup::CleanupConfig;
use crate::detection::{InactivityConfig, DEFAULT_MONITOR_INTERVAL_MS};
use crate::repository::FleetStore;
use crate::triggers::{ErrorTriggerConfig, ProgressTriggerConfig};

const ENV_KEYS: [&str; 15] = [
    "FLEET_STORE_BACKEND",
    "FLEET_SQLITE_DB",
    "FLEET_PROGRESS_MILESTONES",
    "FLEET_PROGRESS_MIN_INTERVAL_MS",
    "FLEET_ERROR_CHECKPOINTS",
    "FLEET_ERROR_MIN_INTERVAL_MS",
    "FLEET_CHECKPOINT_TTL_HOURS",
    "FLEET_CLEANUP_TTL_DAYS",
    "FLEET_CLEANUP_KEEP_PER_MISSION",
    "FLEET_CLEANUP_INCLUDE_COMPLETED",
    "FLEET_CLEANUP_INTERVAL_MS",
    "FLEET_AUTO_CLEANUP",
    "FLEET_INACTIVITY_THRESHOLD_MS",
    "FLEET_MONITOR_INTERVAL_MS",
    "FLEET_AUTO_RESUME",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub backend: StoreBackend,
    pub sqlite_db_path: String,
    pub progress: ProgressTriggerConfig,
    pub error: ErrorTriggerConfig,
    pub checkpoint_ttl_hours: u32,
    pub cleanup: CleanupConfig,
    pub inactivity: InactivityConfig,
    pub monitor_interval_ms: u64,
}

impl RecoveryConfig {
    pub fn from_env(default_sqlite_db_path: &str) -> Result<Self, String> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(default_sqlite_db_path, &envs)
    }

    pub fn from_env_map(
        default_sqlite_db_path: &str,
        envs: &HashMap<String, String>,
    ) -> Result<Self, String> {
        let backend_raw = envs
            .get("FLEET_STORE_BACKEND")
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "sqlite".to_string());
        let backend = match backend_raw.as_str() {
            "sqlite" => StoreBackend::Sqlite,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(format!(
                    "invalid FLEET_STORE_BACKEND='{}'. expected one of: sqlite, memory",
                    other
                ));
            }
        };
        let sqlite_db_path = envs
            .get("FLEET_SQLITE_DB")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_sqlite_db_path.to_string());

        let progress_defaults = ProgressTriggerConfig::default();
        let progress = ProgressTriggerConfig {
            milestones: match envs.get("FLEET_PROGRESS_MILESTONES") {
                Some(raw) => parse_milestones(raw)?,
                None => progress_defaults.milestones,
            },
            min_interval_ms: parse_number(
                envs,
                "FLEET_PROGRESS_MIN_INTERVAL_MS",
                progress_defaults.min_interval_ms,
            )?,
        };

        let error_defaults = ErrorTriggerConfig::default();
        let error = ErrorTriggerConfig {
            enabled: envs
                .get("FLEET_ERROR_CHECKPOINTS")
                .map(|v| parse_bool(v))
                .unwrap_or(error_defaults.enabled),
            min_interval_ms: parse_number(
                envs,
                "FLEET_ERROR_MIN_INTERVAL_MS",
                error_defaults.min_interval_ms,
            )?,
        };

        let cleanup_defaults = CleanupConfig::default();
        let cleanup = CleanupConfig {
            ttl_days: parse_number(envs, "FLEET_CLEANUP_TTL_DAYS", cleanup_defaults.ttl_days)?,
            keep_per_mission: parse_number(
                envs,
                "FLEET_CLEANUP_KEEP_PER_MISSION",
                cleanup_defaults.keep_per_mission,
            )?,
            include_completed_missions: envs
                .get("FLEET_CLEANUP_INCLUDE_COMPLETED")
                .map(|v| parse_bool(v))
                .unwrap_or(cleanup_defaults.include_completed_missions),
            cleanup_interval_ms: parse_number(
                envs,
                "FLEET_CLEANUP_INTERVAL_MS",
                cleanup_defaults.cleanup_interval_ms,
            )?,
            auto_cleanup: envs
                .get("FLEET_AUTO_CLEANUP")
                .map(|v| parse_bool(v))
                .unwrap_or(cleanup_defaults.auto_cleanup),
        };

        let inactivity_defaults = InactivityConfig::default();
        let inactivity = InactivityConfig {
            threshold_ms: parse_number(
                envs,
                "FLEET_INACTIVITY_THRESHOLD_MS",
                inactivity_defaults.threshold_ms,
            )?,
            auto_resume: envs
                .get("FLEET_AUTO_RESUME")
                .map(|v| parse_bool(v))
                .unwrap_or(inactivity_defaults.auto_resume),
        };

        let checkpoint_ttl_hours = parse_number(
            envs,
            "FLEET_CHECKPOINT_TTL_HOURS",
            DEFAULT_CHECKPOINT_TTL_HOURS,
        )?;
        let monitor_interval_ms = parse_number(
            envs,
            "FLEET_MONITOR_INTERVAL_MS",
            DEFAULT_MONITOR_INTERVAL_MS,
        )?;
        if monitor_interval_ms == 0 || cleanup.cleanup_interval_ms == 0 {
            return Err(
                "FLEET_MONITOR_INTERVAL_MS and FLEET_CLEANUP_INTERVAL_MS must be greater than 0"
                    .to_string(),
            );
        }

        Ok(Self {
            backend,
            sqlite_db_path,
            progress,
            error,
            checkpoint_ttl_hours,
            cleanup,
            inactivity,
            monitor_interval_ms,
        })
    }

    /// Coordinator using the configured triggers and checkpoint TTL.
    pub fn checkpoint_coordinator<S: FleetStore>(&self, store: S) -> CheckpointCoordinator<S> {
        CheckpointCoordinator::new(
            CheckpointCreator::with_default_ttl(store, self.checkpoint_ttl_hours),
            self.progress.clone(),
            self.error.clone(),
        )
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            sqlite_db_path: "fleet.db".to_string(),
            progress: ProgressTriggerConfig::default(),
            error: ErrorTriggerConfig::default(),
            checkpoint_ttl_hours: DEFAULT_CHECKPOINT_TTL_HOURS,
            cleanup: CleanupConfig::default(),
            inactivity: InactivityConfig::default(),
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
        }
    }
}

fn parse_number<T: FromStr>(
    envs: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, String> {
    match envs.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            format!(
                "invalid {}='{}'. expected a non-negative integer",
                key, raw
            )
        }),
        None => Ok(default),
    }
}

/// Comma separated, strictly ascending, each in 1..=100.
fn parse_milestones(raw: &str) -> Result<Vec<u8>, String> {
    let mut milestones = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let value: u8 = part
            .parse()
            .map_err(|_| format!("invalid FLEET_PROGRESS_MILESTONES entry '{}'", part))?;
        if !(1..=100).contains(&value) {
            return Err(format!(
                "FLEET_PROGRESS_MILESTONES entry {} is outside 1..=100",
                value
            ));
        }
        if milestones.last().is_some_and(|last| *last >= value) {
            return Err(format!(
                "FLEET_PROGRESS_MILESTONES must be strictly ascending, got '{}'",
                raw
            ));
        }
        milestones.push(value);
    }
    Ok(milestones)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
