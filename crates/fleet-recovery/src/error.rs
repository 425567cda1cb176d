//! Recovery error taxonomy.

use fleet_kernel::KernelError;

/// Errors surfaced by repositories and recovery services.
///
/// Restore and cleanup fold per-item failures into their result objects; only
/// store-level failures escape as `Err`.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("lock conflict on {file}: held by {held_by}")]
    Conflict { file: String, held_by: String },
    #[error("lock on {file} expired: held {age_ms}ms, timeout {timeout_ms}ms")]
    Expired {
        file: String,
        age_ms: u64,
        timeout_ms: u64,
    },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("Store error: {0}")]
    Store(String),
}

impl RecoveryError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RecoveryError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RecoveryError::NotFound { .. })
    }
}

impl From<KernelError> for RecoveryError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::EventStore(msg) => RecoveryError::Store(msg),
            KernelError::Validation(msg) => RecoveryError::Validation(msg),
        }
    }
}

pub(crate) fn map_store_err(prefix: &str, err: impl std::fmt::Display) -> RecoveryError {
    RecoveryError::Store(format!("{prefix}: {err}"))
}
