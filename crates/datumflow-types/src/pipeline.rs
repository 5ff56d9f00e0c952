//! Pipeline descriptor types.
//!
//! Read-only from the worker's perspective: the service layer writes these,
//! the driver only executes against them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::PipelineId;

/// Immutable description of a pipeline, as stored in the Pipelines
/// collection and handed to each worker at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub id: PipelineId,
    pub name: String,
    pub version: u64,
    pub transform: TransformSpec,
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Wall-clock budget for processing a single datum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datum_timeout_secs: Option<f64>,
    /// Wall-clock budget for the whole job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_timeout_secs: Option<f64>,
}

/// The user-supplied program and its execution environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    /// Primary datum-processing command (argv form).
    pub cmd: Vec<String>,
    /// Alternate command run after the primary path fails, for user-defined
    /// cleanup or diagnostics. Empty means no error handler is configured.
    #[serde(default)]
    pub err_cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Resource requests for the worker container. Opaque to this crate;
/// interpreted by the provisioning layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub cpu: f64,
}
