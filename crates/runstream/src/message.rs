//! Run stream message types.
//!
//! The server sends one JSON object per text frame, discriminated by a
//! `type` field:
//! - `snapshot` — full authoritative run state
//! - `run.started` / `run.completed` / `run.failed` / `run.paused` /
//!   `run.resumed` / `run.cancelled` — run status transitions
//! - `step.started` / `step.completed` / `step.failed` / `step.skipped` /
//!   `step.waiting` / `step.retrying` — step status transitions
//! - `context.updated` — shared execution context replacement
//!
//! Decoding is a boundary: a malformed frame or unknown discriminant is an
//! error value here, and the connection layer drops the frame with a
//! diagnostic instead of tearing anything down.

use crate::run::{JsonMap, RunStatus, StepStatus};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur when classifying a stream frame.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// A classified event from the run stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowEvent {
    /// Run this event belongs to.
    pub run_id: String,
    /// Server-side emission time. Snapshots omit it.
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: EventKind,
}

/// Kind-specific payload of a [`WorkflowEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Full authoritative state; replaces everything previously known.
    Snapshot(RunSnapshot),
    /// Run-level status transition.
    RunStatusChanged {
        status: RunStatus,
        error: Option<String>,
    },
    /// Step-level status transition; optional fields merge into the
    /// existing step state only when present.
    StepStatusChanged {
        step_id: String,
        status: StepStatus,
        attempt: Option<u32>,
        output: Option<JsonMap>,
        error: Option<String>,
    },
    /// Wholesale replacement of the shared execution context.
    ContextUpdated { context: JsonMap },
}

/// Full run state carried by a `snapshot` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub run_status: RunStatus,
    pub context: JsonMap,
    pub steps: Vec<SnapshotStep>,
}

/// Per-step entry inside a snapshot. Snapshots carry no step output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SnapshotStep {
    pub step_id: String,
    pub step_type: String,
    pub status: StepStatus,
    pub attempt: u32,
    #[serde(default)]
    pub error: Option<String>,
}

/// Status implied by a step event discriminant, for events that do not
/// carry an explicit `payload.status`.
fn implied_step_status(kind: &str) -> Option<StepStatus> {
    match kind {
        "step.started" => Some(StepStatus::Running),
        "step.completed" => Some(StepStatus::Completed),
        "step.failed" => Some(StepStatus::Failed),
        "step.skipped" => Some(StepStatus::Skipped),
        "step.waiting" => Some(StepStatus::WaitingApproval),
        "step.retrying" => Some(StepStatus::Running),
        _ => None,
    }
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    run_id: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    step_id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    // snapshot frames carry their state at the top level
    #[serde(default)]
    run_status: Option<RunStatus>,
    #[serde(default)]
    context: Option<JsonMap>,
    #[serde(default)]
    steps: Option<Vec<SnapshotStep>>,
}

#[derive(Deserialize)]
struct RunEventPayload {
    status: RunStatus,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Default)]
struct StepEventPayload {
    #[serde(default)]
    status: Option<StepStatus>,
    #[serde(default)]
    attempt: Option<u32>,
    #[serde(default)]
    output: Option<JsonMap>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ContextEventPayload {
    context: JsonMap,
}

impl WorkflowEvent {
    /// Classify a text frame from the stream.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame: RawFrame = serde_json::from_str(json)?;

        let kind = match frame.kind.as_str() {
            "snapshot" => {
                let run_status = frame
                    .run_status
                    .ok_or_else(|| MessageError::MissingField("run_status".to_string()))?;
                let context = frame
                    .context
                    .ok_or_else(|| MessageError::MissingField("context".to_string()))?;
                let steps = frame
                    .steps
                    .ok_or_else(|| MessageError::MissingField("steps".to_string()))?;
                EventKind::Snapshot(RunSnapshot {
                    run_id: frame.run_id.clone(),
                    run_status,
                    context,
                    steps,
                })
            }

            "run.started" | "run.completed" | "run.failed" | "run.paused" | "run.resumed"
            | "run.cancelled" => {
                let payload = frame
                    .payload
                    .ok_or_else(|| MessageError::MissingField("payload".to_string()))?;
                let payload: RunEventPayload = serde_json::from_value(payload)?;
                EventKind::RunStatusChanged {
                    status: payload.status,
                    error: payload.error,
                }
            }

            "step.started" | "step.completed" | "step.failed" | "step.skipped"
            | "step.waiting" | "step.retrying" => {
                let step_id = frame
                    .step_id
                    .ok_or_else(|| MessageError::MissingField("step_id".to_string()))?;
                let payload: StepEventPayload = match frame.payload {
                    Some(value) => serde_json::from_value(value)?,
                    None => StepEventPayload::default(),
                };
                let status = payload
                    .status
                    .or_else(|| implied_step_status(&frame.kind))
                    .unwrap_or_default();
                EventKind::StepStatusChanged {
                    step_id,
                    status,
                    attempt: payload.attempt,
                    output: payload.output,
                    error: payload.error,
                }
            }

            "context.updated" => {
                let payload = frame
                    .payload
                    .ok_or_else(|| MessageError::MissingField("payload".to_string()))?;
                let payload: ContextEventPayload = serde_json::from_value(payload)?;
                EventKind::ContextUpdated {
                    context: payload.context,
                }
            }

            other => return Err(MessageError::UnknownType(other.to_string())),
        };

        Ok(WorkflowEvent {
            run_id: frame.run_id,
            timestamp: frame.timestamp,
            kind,
        })
    }
}
