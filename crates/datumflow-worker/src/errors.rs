//! Worker error model.
//!
//! `User` failures are recorded per datum and never abort the worker
//! process. `System` wraps opaque host-side errors (spawn failures,
//! staging I/O, etc.) that the caller may escalate. Timeouts and
//! cancellation get their own variants so the outer loop can tell a blown
//! time budget apart from an ordinary processing failure.

use datumflow_state::StateError;

/// Categorized failure from datum processing.
#[derive(Debug)]
pub enum DriverError {
    /// User code exited nonzero. Datum-level failure, not fatal to the
    /// worker.
    User { exit_code: Option<i32> },
    /// Host-side failure (spawn, staging I/O, channel, etc.).
    System(anyhow::Error),
    /// The wall-clock budget expired and the process group was terminated.
    Timeout { limit_secs: f64 },
    /// The process group survived the post-timeout grace period.
    TerminationFailed { grace_secs: f64 },
    /// The surrounding context was cancelled mid-operation.
    Canceled,
    /// Optimistic-concurrency loss against the coordination store that
    /// survived the bounded retry policy.
    Conflict { attempts: u32 },
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User {
                exit_code: Some(code),
            } => write!(f, "user code exited with status {code}"),
            Self::User { exit_code: None } => write!(f, "user code terminated by signal"),
            Self::System(e) => write!(f, "{e}"),
            Self::Timeout { limit_secs } => {
                write!(f, "user code timed out after {limit_secs}s")
            }
            Self::TerminationFailed { grace_secs } => {
                write!(f, "user code ignored termination for {grace_secs}s after timeout")
            }
            Self::Canceled => write!(f, "operation canceled"),
            Self::Conflict { attempts } => {
                write!(f, "transaction conflict after {attempts} attempts")
            }
        }
    }
}

impl std::error::Error for DriverError {}

impl From<anyhow::Error> for DriverError {
    fn from(e: anyhow::Error) -> Self {
        Self::System(e)
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        Self::System(e.into())
    }
}

impl From<StateError> for DriverError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Conflict { attempts } => Self::Conflict { attempts },
            other => Self::System(other.into()),
        }
    }
}

impl DriverError {
    /// Returns `true` for datum-level user failures.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    /// Metric state label for this failure kind.
    #[must_use]
    pub fn state_label(&self) -> &'static str {
        match self {
            Self::User { .. } => "user_error",
            Self::System(_) | Self::Conflict { .. } => "system_error",
            Self::Timeout { .. } | Self::TerminationFailed { .. } => "timeout",
            Self::Canceled => "canceled",
        }
    }
}

/// Metric state label for a completed datum-processing attempt.
#[must_use]
pub fn outcome_label(result: &Result<(), DriverError>) -> &'static str {
    match result {
        Ok(()) => "success",
        Err(e) => e.state_label(),
    }
}
