use crate::registry::Key;
use crate::source::ReadError;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum SyncError {
    #[error("Invalid unit: {0:?}")]
    InvalidUnit(String),

    #[error("Invalid variable name: {0:?}")]
    InvalidName(String),

    #[error("Read of {key} failed: {source}")]
    ReadFailed { key: Key, source: ReadError },

    #[error("Read of {key} timed out after {timeout_ms}ms")]
    ReadTimedOut { key: Key, timeout_ms: u64 },

    #[error("Subscription {0} is not tracked")]
    UnknownKeyOnUnsubscribe(u64),

    #[error("Write of {key} failed: {source}")]
    WriteFailed { key: Key, source: ReadError },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether this error is a transient host-communication miss that the
    /// poll loop absorbs instead of surfacing to consumers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::ReadFailed { .. } | SyncError::ReadTimedOut { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
