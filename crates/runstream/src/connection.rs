//! Run stream subscription management.
//!
//! Provides the reconnecting WebSocket subscription for one run: connect,
//! classify incoming frames, apply them to the reconciliation store, and
//! reconnect with exponential backoff on abnormal closure until the retry
//! budget is spent.

use crate::backoff::{BackoffPolicy, MAX_RETRIES};
use crate::error::{ClientError, Result};
use crate::message::{MessageError, WorkflowEvent};
use crate::store::{RunState, RunStore};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of a run subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; terminal after a normal close or teardown.
    Disconnected,
    /// Opening the transport (attempt 0 is the initial connect).
    Connecting { attempt: u32 },
    /// Transport open, frames flowing.
    Connected,
    /// Waiting out the backoff delay before reconnect attempt `attempt`.
    BackingOff { attempt: u32 },
    /// Retry budget exhausted; a fresh subscription is required.
    GivenUp,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::GivenUp)
    }
}

/// Events emitted by a run subscription.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Transport opened; the attempt counter has reset.
    Connected,
    /// A successfully classified event, already applied to the store.
    Event(WorkflowEvent),
    /// Transport lost; `attempt` is the reconnect counter at close time.
    Disconnected {
        attempt: u32,
        /// Close reason, when the transport reported one.
        reason: Option<String>,
    },
    /// Retry budget exhausted; no further attempts will be made.
    GaveUp { attempts: u32 },
}

/// Run stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Server base URL (`ws://` or `wss://`).
    pub base_url: Url,
    /// Timeout for one transport open.
    pub connect_timeout: Duration,
    /// Reconnect attempts before giving up.
    pub max_retries: u32,
    /// Delay policy between reconnect attempts.
    pub backoff: BackoffPolicy,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl StreamConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.scheme() != "ws" && base_url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                base_url.scheme()
            )));
        }
        Ok(Self {
            base_url,
            connect_timeout: Duration::from_secs(10),
            max_retries: MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            event_buffer: 256,
        })
    }

    fn run_url(&self, run_id: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(&format!("/ws/runs/{run_id}"));
        url
    }
}

/// How one transport session ended.
enum SessionEnd {
    /// Consumer tore the subscription down; the transport was closed with
    /// the normal code so the server does not see a failure.
    Teardown,
    /// Server closed with the normal code; terminal.
    Normal,
    /// Anything else: abnormal close, read error, connect failure.
    Abnormal(String),
}

/// A live subscription to one run's event stream.
///
/// Owns the background task driving the connect/read/backoff loop and the
/// reconciliation store for the run. Consumers read through
/// [`RunSubscription::state`] (latest [`RunState`]) and
/// [`RunSubscription::events`] (classified events in arrival order).
/// Dropping the handle tears the subscription down.
pub struct RunSubscription {
    run_id: String,
    destroyed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<RunState>,
    conn_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<StreamEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl RunSubscription {
    /// Start a subscription for `run_id`. Connection establishment and all
    /// recovery happen on a background task; failures surface only as
    /// connection-state values, never as errors.
    pub fn spawn(config: StreamConfig, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let store = RunStore::new(&run_id);
        let state_rx = store.subscribe();
        // Seed with the value the task publishes first, so a watcher can
        // never observe a terminal `Disconnected` before the loop starts.
        let (conn_tx, conn_rx) = watch::channel(ConnectionState::Connecting { attempt: 0 });
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let destroyed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_loop(
            config,
            run_id.clone(),
            store,
            conn_tx,
            events_tx.clone(),
            shutdown_rx,
            Arc::clone(&destroyed),
        ));

        Self {
            run_id,
            destroyed,
            shutdown_tx,
            state_rx,
            conn_rx,
            events_tx,
            task,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Watch the reconciled run state.
    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state_rx.clone()
    }

    /// Watch connection-state transitions.
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.conn_rx.clone()
    }

    /// Receive classified events in arrival order.
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events_tx.subscribe()
    }

    /// Tear the subscription down: no further reconnect attempts, any
    /// pending backoff timer is cancelled, and an open transport is closed
    /// with the normal code. Synchronous and idempotent.
    pub fn close(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(run_id = %self.run_id, "tearing down run subscription");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Wait for the background task to finish (after [`close`], or after
    /// the subscription reached a terminal state on its own).
    ///
    /// [`close`]: RunSubscription::close
    pub async fn finished(&mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for RunSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_loop(
    config: StreamConfig,
    run_id: String,
    mut store: RunStore,
    conn_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<StreamEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    destroyed: Arc<AtomicBool>,
) {
    let url = config.run_url(&run_id);
    let mut attempt: u32 = 0;

    loop {
        if destroyed.load(Ordering::SeqCst) {
            return;
        }

        let _ = conn_tx.send(ConnectionState::Connecting { attempt });
        debug!(%url, attempt, "connecting to run stream");

        let result = tokio::select! {
            _ = shutdown_rx.changed() => return,
            result = timeout(config.connect_timeout, connect_async(url.as_str())) => result,
        };

        let end = match result {
            Ok(Ok((ws, _response))) => {
                attempt = 0;
                let _ = conn_tx.send(ConnectionState::Connected);
                store.set_connected(true, 0);
                let _ = events_tx.send(StreamEvent::Connected);
                info!(%url, "run stream connected");
                read_session(ws, &mut store, &events_tx, &mut shutdown_rx).await
            }
            Ok(Err(err)) => {
                warn!(%url, error = %err, "run stream connect failed");
                SessionEnd::Abnormal(err.to_string())
            }
            Err(_) => {
                warn!(%url, timeout_secs = config.connect_timeout.as_secs(), "run stream connect timed out");
                SessionEnd::Abnormal("connect timeout".to_string())
            }
        };

        match end {
            SessionEnd::Teardown => {
                store.set_connected(false, attempt);
                let _ = conn_tx.send(ConnectionState::Disconnected);
                return;
            }
            SessionEnd::Normal => {
                store.set_connected(false, attempt);
                let _ = events_tx.send(StreamEvent::Disconnected {
                    attempt,
                    reason: None,
                });
                let _ = conn_tx.send(ConnectionState::Disconnected);
                info!(%url, "run stream closed normally");
                return;
            }
            SessionEnd::Abnormal(reason) => {
                store.set_connected(false, attempt);
                let _ = events_tx.send(StreamEvent::Disconnected {
                    attempt,
                    reason: Some(reason),
                });

                if destroyed.load(Ordering::SeqCst) {
                    let _ = conn_tx.send(ConnectionState::Disconnected);
                    return;
                }
                if attempt >= config.max_retries {
                    warn!(%url, attempts = attempt, "giving up on run stream after retry budget");
                    let _ = conn_tx.send(ConnectionState::GivenUp);
                    let _ = events_tx.send(StreamEvent::GaveUp { attempts: attempt });
                    return;
                }

                let delay = config.backoff.delay(attempt);
                let _ = conn_tx.send(ConnectionState::BackingOff { attempt });
                attempt += 1;
                info!(
                    %url,
                    delay_ms = delay.as_millis() as u64,
                    attempt,
                    "reconnecting after backoff"
                );
                tokio::select! {
                    // Teardown cancels the pending timer; nothing is
                    // published after it.
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn read_session(
    mut ws: WsStream,
    store: &mut RunStore,
    events_tx: &broadcast::Sender<StreamEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client teardown".into(),
                };
                if let Err(err) = ws.close(Some(frame)).await {
                    debug!(error = %err, "error closing run stream during teardown");
                }
                return SessionEnd::Teardown;
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(text.as_str(), store, events_tx),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(err) = ws.send(Message::Pong(data)).await {
                        debug!(error = %err, "failed to answer ping");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if frame.code == CloseCode::Normal => SessionEnd::Normal,
                        Some(frame) => SessionEnd::Abnormal(format!(
                            "close code {}: {}",
                            u16::from(frame.code),
                            frame.reason
                        )),
                        None => SessionEnd::Abnormal("closed without a close frame".to_string()),
                    };
                }
                // Binary, pong and fragments are not part of this protocol.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    // Logged only; the session ending below is the single
                    // signal driving the reconnect decision.
                    warn!(error = %err, "run stream read error");
                    return SessionEnd::Abnormal(err.to_string());
                }
                None => return SessionEnd::Abnormal("stream ended unexpectedly".to_string()),
            }
        }
    }
}

/// Classify one text frame and apply it. Decode failures are contained
/// here: logged, dropped, and never allowed to disturb the connection.
fn handle_frame(text: &str, store: &mut RunStore, events_tx: &broadcast::Sender<StreamEvent>) {
    match WorkflowEvent::from_json(text) {
        Ok(event) => {
            store.apply(&event);
            let _ = events_tx.send(StreamEvent::Event(event));
        }
        Err(MessageError::UnknownType(kind)) => {
            warn!(%kind, "dropping frame with unrecognised event type");
        }
        Err(err) => {
            warn!(error = %err, "dropping undecodable frame");
        }
    }
}
