//! Checkpoint triggers: pure, rate-limited decisions on when to snapshot.
//!
//! Neither trigger touches a store. Callers pass `now` explicitly so decisions
//! are deterministic under test; the `*_now` helpers use the wall clock.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::{BlockerInfo, BlockerType};

pub const DEFAULT_PROGRESS_MILESTONES: [u8; 3] = [25, 50, 75];
pub const DEFAULT_PROGRESS_MIN_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_ERROR_MIN_INTERVAL_MS: u64 = 30_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressTriggerConfig {
    /// Ascending percentages.
    pub milestones: Vec<u8>,
    pub min_interval_ms: u64,
}

impl Default for ProgressTriggerConfig {
    fn default() -> Self {
        Self {
            milestones: DEFAULT_PROGRESS_MILESTONES.to_vec(),
            min_interval_ms: DEFAULT_PROGRESS_MIN_INTERVAL_MS,
        }
    }
}

/// Fires once per milestone crossing.
///
/// The watermark is the highest milestone already covered by a recorded
/// checkpoint; jumping over several milestones between calls yields one trigger.
#[derive(Clone, Debug)]
pub struct ProgressTrigger {
    config: ProgressTriggerConfig,
    watermark: u8,
    last_checkpoint_at: Option<DateTime<Utc>>,
}

impl ProgressTrigger {
    pub fn new(mut config: ProgressTriggerConfig) -> Self {
        config.milestones.sort_unstable();
        config.milestones.dedup();
        Self {
            config,
            watermark: 0,
            last_checkpoint_at: None,
        }
    }

    /// Highest configured milestone at or below `progress`.
    fn milestone_reached(&self, progress: u8) -> Option<u8> {
        self.config
            .milestones
            .iter()
            .copied()
            .filter(|m| *m <= progress)
            .max()
    }

    pub fn should_checkpoint(&self, progress: u8, now: DateTime<Utc>) -> bool {
        let crossed_new = self
            .milestone_reached(progress)
            .is_some_and(|m| m > self.watermark);
        crossed_new && self.interval_elapsed(now)
    }

    pub fn should_checkpoint_now(&self, progress: u8) -> bool {
        self.should_checkpoint(progress, Utc::now())
    }

    fn interval_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_checkpoint_at {
            Some(last) => now - last >= Duration::milliseconds(self.config.min_interval_ms as i64),
            None => true,
        }
    }

    /// Advances the watermark after a successful checkpoint at `progress`.
    pub fn record_checkpoint(&mut self, progress: u8, now: DateTime<Utc>) {
        if let Some(m) = self.milestone_reached(progress) {
            self.watermark = self.watermark.max(m);
        }
        self.last_checkpoint_at = Some(now);
    }

    pub fn watermark(&self) -> u8 {
        self.watermark
    }

    pub fn last_checkpoint_at(&self) -> Option<DateTime<Utc>> {
        self.last_checkpoint_at
    }

    pub fn reset(&mut self) {
        self.watermark = 0;
        self.last_checkpoint_at = None;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorTriggerConfig {
    pub enabled: bool,
    pub min_interval_ms: u64,
}

impl Default for ErrorTriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: DEFAULT_ERROR_MIN_INTERVAL_MS,
        }
    }
}

/// Rate-limited error checkpoint gate plus a per-sortie blocker ledger.
///
/// Blockers stay filed until [ErrorTrigger::clear] or [ErrorTrigger::clear_all].
/// Coalescing repeated errors is the caller's job.
#[derive(Clone, Debug)]
pub struct ErrorTrigger {
    config: ErrorTriggerConfig,
    last_checkpoint_at: Option<DateTime<Utc>>,
    blockers: BTreeMap<String, Vec<BlockerInfo>>,
}

impl ErrorTrigger {
    pub fn new(config: ErrorTriggerConfig) -> Self {
        Self {
            config,
            last_checkpoint_at: None,
            blockers: BTreeMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Rate-limit gate only; ignores whether blockers exist.
    pub fn should_checkpoint(&self, now: DateTime<Utc>) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.last_checkpoint_at {
            Some(last) => now - last >= Duration::milliseconds(self.config.min_interval_ms as i64),
            None => true,
        }
    }

    pub fn record_checkpoint(&mut self, now: DateTime<Utc>) {
        self.last_checkpoint_at = Some(now);
    }

    /// Files a blocker under its affected sortie (or `unassigned`).
    pub fn record_blocker(&mut self, blocker: BlockerInfo) -> BlockerInfo {
        let key = blocker
            .affected_sortie
            .clone()
            .unwrap_or_else(|| "unassigned".to_string());
        self.blockers.entry(key).or_default().push(blocker.clone());
        blocker
    }

    pub fn record_exception(
        &mut self,
        sortie_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> BlockerInfo {
        self.record_blocker(
            BlockerInfo::new(BlockerType::Exception, format!("Exception: {message}"), now)
                .for_sortie(sortie_id)
                .with_hint("Inspect the failing step and retry once the cause is fixed"),
        )
    }

    pub fn record_api_error(
        &mut self,
        sortie_id: &str,
        endpoint: &str,
        status: Option<u16>,
        message: &str,
        now: DateTime<Utc>,
    ) -> BlockerInfo {
        let description = match status {
            Some(code) => format!("API call to {endpoint} failed with {code}: {message}"),
            None => format!("API call to {endpoint} failed: {message}"),
        };
        let mut blocker = BlockerInfo::new(BlockerType::ApiError, description, now)
            .for_sortie(sortie_id)
            .with_hint("Check service availability and credentials, then retry");
        if let Some(code) = status {
            blocker = blocker.with_error_code(code.to_string());
        }
        self.record_blocker(blocker)
    }

    pub fn record_lock_timeout(
        &mut self,
        sortie_id: &str,
        file: &str,
        held_by: &str,
        now: DateTime<Utc>,
    ) -> BlockerInfo {
        self.record_blocker(
            BlockerInfo::new(
                BlockerType::LockTimeout,
                format!("Timed out waiting for lock on {file} held by {held_by}"),
                now,
            )
            .for_sortie(sortie_id)
            .with_hint(format!("Coordinate with {held_by} or wait for the lock to expire")),
        )
    }

    pub fn record_message_failure(
        &mut self,
        sortie_id: &str,
        message_id: &str,
        recipient: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BlockerInfo {
        self.record_blocker(
            BlockerInfo::new(
                BlockerType::MessageFailure,
                format!("Message {message_id} to {recipient} failed: {reason}"),
                now,
            )
            .for_sortie(sortie_id)
            .with_hint("Resend the message once the recipient is reachable"),
        )
    }

    pub fn record_dependency_blocker(
        &mut self,
        sortie_id: &str,
        depends_on: &str,
        now: DateTime<Utc>,
    ) -> BlockerInfo {
        self.record_blocker(
            BlockerInfo::new(
                BlockerType::Dependency,
                format!("Waiting on {depends_on}"),
                now,
            )
            .for_sortie(sortie_id)
            .with_hint(format!("Complete {depends_on} first")),
        )
    }

    pub fn blockers_for(&self, sortie_id: &str) -> &[BlockerInfo] {
        self.blockers
            .get(sortie_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_blockers(&self) -> Vec<BlockerInfo> {
        self.blockers.values().flatten().cloned().collect()
    }

    pub fn clear(&mut self, sortie_id: &str) {
        self.blockers.remove(sortie_id);
    }

    pub fn clear_all(&mut self) {
        self.blockers.clear();
    }
}
