//! Shared run and step types.
//!
//! These mirror the shapes the workflow engine serves over both the REST
//! interface and the event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Open-ended key/value mapping used for step outputs, trigger payloads
/// and the shared execution context.
pub type JsonMap = Map<String, Value>;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Lifecycle status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    WaitingApproval,
}

/// One step execution as served by the REST interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub input: JsonMap,
    #[serde(default)]
    pub output: Option<JsonMap>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One run as served by the REST interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub trigger_payload: Option<JsonMap>,
    #[serde(default)]
    pub step_runs: Vec<StepRun>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}
