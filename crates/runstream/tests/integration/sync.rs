//! State convergence: snapshots, live events, and the merge discipline
//! observed end to end through a subscription.

use super::*;
use futures::SinkExt;
use runstream::{RunStatus, RunSubscription, StepStatus, StreamEvent};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

fn snapshot_frame(run_id: &str, steps: Value) -> Message {
    text(json!({
        "type": "snapshot",
        "run_id": run_id,
        "run_status": "running",
        "context": {"user": "ada"},
        "steps": steps
    }))
}

#[tokio::test]
async fn snapshot_then_live_events_converge() {
    let addr = start_stream_server(|mut ws| async move {
        let frames = [
            snapshot_frame(
                "r1",
                json!([
                    {"step_id": "s1", "step_type": "http_request", "status": "running", "attempt": 1},
                    {"step_id": "s2", "step_type": "transform", "status": "pending", "attempt": 1}
                ]),
            ),
            text(json!({
                "type": "step.completed",
                "run_id": "r1",
                "timestamp": "2026-01-05T12:00:01Z",
                "step_id": "s1",
                "payload": {"status": "completed", "output": {"code": 200}}
            })),
            text(json!({
                "type": "context.updated",
                "run_id": "r1",
                "timestamp": "2026-01-05T12:00:02Z",
                "payload": {"context": {"user": "ada", "token": "abc"}}
            })),
            text(json!({
                "type": "run.completed",
                "run_id": "r1",
                "timestamp": "2026-01-05T12:00:03Z",
                "payload": {"status": "completed"}
            })),
        ];
        for frame in frames {
            ws.send(frame).await.unwrap();
        }
        hold_open(ws).await;
    })
    .await;

    let sub = RunSubscription::spawn(fast_config(addr), "r1");
    let mut events = sub.events();
    let mut state_rx = sub.state();

    let state = wait_for_state(&mut state_rx, |s| s.run_status == RunStatus::Completed).await;

    assert!(state.connected);
    assert_eq!(state.steps.len(), 2);
    let s1 = &state.steps["s1"];
    assert_eq!(s1.status, StepStatus::Completed);
    assert_eq!(s1.step_type, "http_request");
    assert_eq!(s1.output.as_ref().unwrap()["code"], 200);
    assert_eq!(state.steps["s2"].status, StepStatus::Pending);
    assert_eq!(state.context["token"], "abc");

    // Events surfaced on the broadcast channel in arrival order.
    let mut received = Vec::new();
    while received.len() < 4 {
        if let StreamEvent::Event(event) = events.recv().await.unwrap() {
            received.push(event);
        }
    }
    assert!(matches!(received[0].kind, runstream::EventKind::Snapshot(_)));
    assert!(matches!(
        received[3].kind,
        runstream::EventKind::RunStatusChanged {
            status: RunStatus::Completed,
            ..
        }
    ));

    sub.close();
}

#[tokio::test]
async fn undecodable_frames_do_not_disturb_the_stream() {
    let addr = start_stream_server(|mut ws| async move {
        let frames = [
            Message::Text("not json at all".into()),
            text(json!({"type": "approval.required", "run_id": "r1"})),
            text(json!({
                "type": "run.started",
                "run_id": "r1",
                "timestamp": "2026-01-05T12:00:00Z",
                "payload": {"status": "running"}
            })),
        ];
        for frame in frames {
            ws.send(frame).await.unwrap();
        }
        hold_open(ws).await;
    })
    .await;

    let sub = RunSubscription::spawn(fast_config(addr), "r1");
    let mut state_rx = sub.state();

    let state = wait_for_state(&mut state_rx, |s| s.run_status == RunStatus::Running).await;
    // The two bad frames were dropped without touching the connection.
    assert!(state.connected);
    assert_eq!(state.reconnect_attempt, 0);

    sub.close();
}

#[tokio::test]
async fn events_for_other_runs_do_not_leak() {
    let addr = start_stream_server(|mut ws| async move {
        let frames = [
            text(json!({
                "type": "run.failed",
                "run_id": "r2",
                "timestamp": "2026-01-05T12:00:00Z",
                "payload": {"status": "failed", "error": "other run"}
            })),
            text(json!({
                "type": "run.started",
                "run_id": "r1",
                "timestamp": "2026-01-05T12:00:01Z",
                "payload": {"status": "running"}
            })),
        ];
        for frame in frames {
            ws.send(frame).await.unwrap();
        }
        hold_open(ws).await;
    })
    .await;

    let sub = RunSubscription::spawn(fast_config(addr), "r1");
    let mut state_rx = sub.state();

    let state = wait_for_state(&mut state_rx, |s| s.run_status == RunStatus::Running).await;
    assert_eq!(state.run_id, "r1");
    assert!(state.error_message.is_none());

    sub.close();
}

#[tokio::test]
async fn reconnect_snapshot_replaces_stale_steps() {
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let addr = start_stream_server(move |mut ws| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                // First session: two steps, then the transport dies.
                ws.send(snapshot_frame(
                    "r1",
                    json!([
                        {"step_id": "s1", "step_type": "http_request", "status": "running", "attempt": 1},
                        {"step_id": "stale", "step_type": "transform", "status": "pending", "attempt": 1}
                    ]),
                ))
                .await
                .unwrap();
                // Dropping without a close handshake forces a reconnect.
            } else {
                // Re-snapshot after reconnect: the stale step is gone.
                ws.send(snapshot_frame(
                    "r1",
                    json!([
                        {"step_id": "s1", "step_type": "http_request", "status": "completed", "attempt": 2}
                    ]),
                ))
                .await
                .unwrap();
                hold_open(ws).await;
            }
        }
    })
    .await;

    let sub = RunSubscription::spawn(fast_config(addr), "r1");
    let mut state_rx = sub.state();
    let mut conn_rx = sub.connection();

    wait_for_state(&mut state_rx, |s| s.steps.contains_key("stale")).await;
    wait_for_connection(&mut conn_rx, |c| {
        matches!(c, runstream::ConnectionState::BackingOff { .. })
    })
    .await;

    let state = wait_for_state(&mut state_rx, |s| {
        s.connected && s.steps.get("s1").is_some_and(|s| s.status == StepStatus::Completed)
    })
    .await;

    assert!(!state.steps.contains_key("stale"));
    assert_eq!(state.steps["s1"].attempt, 2);
    assert_eq!(state.reconnect_attempt, 0);
    assert!(connections.load(Ordering::SeqCst) >= 2);

    sub.close();
}
