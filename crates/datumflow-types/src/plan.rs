//! Work-partitioning records.
//!
//! A job's datums are divided into chunks by a plan; shards map chunk ranges
//! to workers, and merges track the combination of partial outputs. The
//! worker reads these but only the state crate's job teardown deletes them.

use serde::{Deserialize, Serialize};

use crate::ids::JobId;

/// How a job's datums are split into chunks. `chunks` holds the exclusive
/// upper datum index of each chunk, in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub job: JobId,
    pub chunks: Vec<u64>,
}

/// Assignment of a shard to a worker replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub id: u64,
    pub worker: String,
}

/// Processing state of one chunk of datums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub job: JobId,
    pub id: u64,
    pub state: ChunkState,
}

/// State of one merge of partial outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub job: JobId,
    pub id: u64,
    pub state: MergeState,
}
