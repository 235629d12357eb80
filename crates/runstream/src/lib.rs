//! Workflow run-state synchronization client.
//!
//! This crate provides:
//! - A reconnecting WebSocket subscription to a run's event stream
//!   (exponential backoff with jitter, bounded retry budget)
//! - Frame classification for the run stream protocol
//! - A reconciliation store merging authoritative snapshots with
//!   incremental status events
//! - A REST client for triggering, fetching, cancelling and resuming runs
//!
//! # Example
//!
//! ```rust,no_run
//! use runstream::{RunSubscription, StreamConfig, StreamEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = StreamConfig::new("ws://localhost:8000").unwrap();
//!     let sub = RunSubscription::spawn(config, "run-42");
//!
//!     // Watch the reconciled state converge...
//!     let mut state = sub.state();
//!     let mut events = sub.events();
//!
//!     // ...or react to individual events as they arrive.
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let StreamEvent::Event(event) = event {
//!                 println!("event for run {}", event.run_id);
//!             }
//!         }
//!     });
//!
//!     while state.changed().await.is_ok() {
//!         let snapshot = state.borrow().clone();
//!         println!("{}: {:?}", snapshot.run_id, snapshot.run_status);
//!     }
//!
//!     sub.close();
//! }
//! ```

mod api;
mod backoff;
mod connection;
mod error;
mod message;
mod run;
mod store;

// Re-export main types
pub use api::RunsApi;
pub use backoff::{BackoffPolicy, BASE_DELAY, JITTER_MAX, MAX_DELAY, MAX_RETRIES};
pub use connection::{ConnectionState, RunSubscription, StreamConfig, StreamEvent};
pub use error::{ClientError, Result};
pub use message::{EventKind, MessageError, RunSnapshot, SnapshotStep, WorkflowEvent};
pub use run::{JsonMap, Run, RunStatus, StepRun, StepStatus};
pub use store::{RunState, RunStore, StepState};
