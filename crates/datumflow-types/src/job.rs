//! Job state model.
//!
//! A [`JobRecord`] is the coordination-store document for one pipeline job.
//! State transitions are monotonic: once a job reaches a terminal state it
//! never leaves it. All mutation goes through the state crate.

use serde::{Deserialize, Serialize};

use crate::ids::{CommitRef, JobId, PipelineId};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Running,
    Success,
    Failure,
    Killed,
}

impl JobState {
    /// Wire-format string for storage and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Killed => "killed",
        }
    }

    /// Terminal states absorb: no transition out of them is ever accepted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Killed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordination-store record for one job.
///
/// `reason` always describes the most recent transition. The datum counters
/// are aggregated by the worker fleet as chunks complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: JobId,
    pub pipeline: PipelineId,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_commit: Option<CommitRef>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub restart: u64,
    #[serde(default)]
    pub data_processed: u64,
    #[serde(default)]
    pub data_skipped: u64,
    #[serde(default)]
    pub data_total: u64,
}

impl JobRecord {
    /// Create a job record in the `Created` state.
    #[must_use]
    pub fn new(job: JobId, pipeline: PipelineId) -> Self {
        Self {
            job,
            pipeline,
            state: JobState::Created,
            stats_commit: None,
            reason: String::new(),
            restart: 0,
            data_processed: 0,
            data_skipped: 0,
            data_total: 0,
        }
    }
}
