//! Reconciliation store: the canonical local view of one run.
//!
//! All mutation goes through [`RunStore`], which lives on the subscription
//! task. Consumers watch [`RunState`] snapshots through a
//! `tokio::sync::watch` channel; every applied operation publishes exactly
//! one update.
//!
//! Merge discipline: a snapshot replaces everything it covers; a live
//! event merges only the fields it actually carries. The visible state is
//! therefore always "last snapshot + idempotent merges in arrival order",
//! which is what lets the stream survive duplicate delivery and
//! reordering across reconnects.

use crate::message::{EventKind, RunSnapshot, WorkflowEvent};
use crate::run::{JsonMap, RunStatus, StepStatus};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::warn;

/// Step type recorded for steps first seen through a live event.
const UNKNOWN_STEP_TYPE: &str = "unknown";

/// Synchronized view of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepState {
    pub step_id: String,
    /// Informational; "unknown" until a snapshot names the real type.
    pub step_type: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub output: Option<JsonMap>,
    pub error: Option<String>,
}

impl StepState {
    /// Placeholder for a step first referenced by a live event.
    fn placeholder(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            step_type: UNKNOWN_STEP_TYPE.to_string(),
            status: StepStatus::Pending,
            attempt: 1,
            output: None,
            error: None,
        }
    }
}

/// Synchronized view of one run, including the transport's health.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunState {
    pub run_id: String,
    pub run_status: RunStatus,
    /// Error from the most recent run-level failure event, if any.
    pub error_message: Option<String>,
    /// Shared execution context, replaced wholesale on update.
    pub context: JsonMap,
    pub steps: HashMap<String, StepState>,
    /// Whether the event stream is currently connected.
    pub connected: bool,
    /// Reconnect attempt counter last reported by the connection manager.
    pub reconnect_attempt: u32,
}

impl RunState {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }
}

/// Single mutable source of truth for one run subscription.
pub struct RunStore {
    state: RunState,
    tx: watch::Sender<RunState>,
}

impl RunStore {
    pub fn new(run_id: impl AsRef<str>) -> Self {
        let state = RunState::new(run_id.as_ref());
        let (tx, _) = watch::channel(state.clone());
        Self { state, tx }
    }

    /// Watch state snapshots; the receiver always holds the latest value.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Apply a classified event. Events for a different run id are logged
    /// and ignored so state from one run can never leak into another.
    pub fn apply(&mut self, event: &WorkflowEvent) {
        if event.run_id != self.state.run_id {
            warn!(
                run_id = %self.state.run_id,
                event_run_id = %event.run_id,
                "dropping event for different run"
            );
            return;
        }
        match &event.kind {
            EventKind::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            EventKind::RunStatusChanged { status, error } => {
                self.apply_run_status(*status, error.clone())
            }
            EventKind::StepStatusChanged {
                step_id,
                status,
                attempt,
                output,
                error,
            } => self.apply_step_status(step_id, *status, *attempt, output.clone(), error.clone()),
            EventKind::ContextUpdated { context } => self.apply_context(context.clone()),
        }
    }

    /// Replace run status, context and the entire step mapping with the
    /// snapshot's authoritative contents. One observable change.
    pub fn apply_snapshot(&mut self, snapshot: &RunSnapshot) {
        self.state.run_status = snapshot.run_status;
        self.state.error_message = None;
        self.state.context = snapshot.context.clone();
        self.state.steps = snapshot
            .steps
            .iter()
            .map(|step| {
                (
                    step.step_id.clone(),
                    StepState {
                        step_id: step.step_id.clone(),
                        step_type: step.step_type.clone(),
                        status: step.status,
                        attempt: step.attempt,
                        output: None,
                        error: step.error.clone(),
                    },
                )
            })
            .collect();
        self.publish();
    }

    /// Unconditional overwrite; transition ordering is the engine's
    /// responsibility, not re-validated here.
    pub fn apply_run_status(&mut self, status: RunStatus, error: Option<String>) {
        self.state.run_status = status;
        if error.is_some() {
            self.state.error_message = error;
        }
        self.publish();
    }

    /// Merge a step transition. Creates a placeholder entry for an unknown
    /// step id; merges only the fields present in the event, so duplicate
    /// delivery or field-sparse events never erase known information. The
    /// attempt counter only moves forward on live events; snapshots are
    /// the one authority allowed to reset it.
    pub fn apply_step_status(
        &mut self,
        step_id: &str,
        status: StepStatus,
        attempt: Option<u32>,
        output: Option<JsonMap>,
        error: Option<String>,
    ) {
        let step = self
            .state
            .steps
            .entry(step_id.to_string())
            .or_insert_with(|| StepState::placeholder(step_id));
        step.status = status;
        if let Some(attempt) = attempt {
            step.attempt = step.attempt.max(attempt);
        }
        if output.is_some() {
            step.output = output;
        }
        if error.is_some() {
            step.error = error;
        }
        self.publish();
    }

    /// Replace the shared context wholesale (last writer wins).
    pub fn apply_context(&mut self, context: JsonMap) {
        self.state.context = context;
        self.publish();
    }

    /// Record a connection transition reported by the connection manager.
    pub fn set_connected(&mut self, connected: bool, attempt: u32) {
        self.state.connected = connected;
        self.state.reconnect_attempt = attempt;
        self.publish();
    }

    /// Clear everything back to initial values. Used on teardown and when
    /// switching runs, so stale state never survives the subscription.
    pub fn reset(&mut self) {
        let run_id = std::mem::take(&mut self.state.run_id);
        self.state = RunState::new(&run_id);
        self.publish();
    }

    fn publish(&self) {
        // Receivers may all be gone; that just means nobody is watching.
        let _ = self.tx.send(self.state.clone());
    }
}
