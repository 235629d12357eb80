//! Integration tests driving a [`RunSubscription`] against an in-process
//! WebSocket server, covering state convergence and the reconnect
//! lifecycle end to end.
//!
//! [`RunSubscription`]: runstream::RunSubscription

mod sync;

use runstream::{BackoffPolicy, ConnectionState, RunState, StreamConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub type ServerWs = WebSocketStream<TcpStream>;

/// One JSON stream frame.
pub fn text(value: serde_json::Value) -> tokio_tungstenite::tungstenite::Message {
    tokio_tungstenite::tungstenite::Message::Text(value.to_string().into())
}

/// Keep a server-side connection open until the client goes away.
pub async fn hold_open(mut ws: ServerWs) {
    use futures::StreamExt;
    while ws.next().await.is_some() {}
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Bind on an OS-assigned port and serve every incoming WebSocket
/// connection with `handler` on its own task.
pub async fn start_stream_server<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(ServerWs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            match accept_async(stream).await {
                Ok(ws) => {
                    tokio::spawn(handler(ws));
                }
                Err(_) => continue,
            }
        }
    });
    addr
}

/// An address nothing listens on, for connect-failure scenarios.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Stream config with millisecond-scale backoff so reconnect scenarios
/// finish quickly.
pub fn fast_config(addr: SocketAddr) -> StreamConfig {
    init_tracing();
    let mut config = StreamConfig::new(&format!("ws://{addr}")).unwrap();
    config.backoff = BackoffPolicy {
        base: Duration::from_millis(10),
        jitter: Duration::from_millis(5),
        cap: Duration::from_millis(50),
    };
    config.connect_timeout = Duration::from_secs(2);
    config
}

pub async fn wait_for_connection(
    rx: &mut watch::Receiver<ConnectionState>,
    pred: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    *timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for connection state")
        .expect("subscription task dropped its state channel")
}

pub async fn wait_for_state(
    rx: &mut watch::Receiver<RunState>,
    pred: impl FnMut(&RunState) -> bool,
) -> RunState {
    timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for run state")
        .expect("subscription task dropped its state channel")
        .clone()
}
