//! Coordination-store error types.

use datumflow_types::ids::JobId;
use datumflow_types::job::JobState;

/// Errors produced by [`CoordStore`](crate::CoordStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document failed to encode or decode.
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("coordination store lock poisoned")]
    LockPoisoned,

    /// Optimistic-concurrency loss that survived the bounded retry policy.
    #[error("transaction conflict after {attempts} attempts")]
    Conflict { attempts: u32 },

    /// A job-state mutation referenced a job with no record.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// A job-state mutation would move the state backwards or out of a
    /// terminal state.
    #[error("job {job}: invalid transition {from} -> {to}")]
    InvalidTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },
}

impl StateError {
    /// True for the validation failures a caller cannot retry away.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::InvalidTransition { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
