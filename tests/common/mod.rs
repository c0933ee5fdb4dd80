#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

use logdeck::registry::ConnectionRegistry;
use logdeck::router::MessageRouter;
use logdeck::server::{self, AppState};
use logdeck::shutdown::ShutdownCoordinator;
use logdeck::supervisor::{IndexerSupervisor, WorkerConfig};

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A running in-process server plus the handles tests need to drive it.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub listener_shutdown: Option<oneshot::Sender<()>>,
}

/// Supervisor over a worker that can never start; state stays `Stopped`.
pub fn stopped_supervisor() -> IndexerSupervisor {
    IndexerSupervisor::new(WorkerConfig::new(
        "/nonexistent/logdeck-indexer".into(),
        "127.0.0.1".into(),
        0,
        std::env::temp_dir(),
    ))
}

pub fn test_state_with_supervisor(supervisor: IndexerSupervisor) -> AppState {
    let router = MessageRouter::new();
    server::register_builtin_handlers(&router, &supervisor);
    AppState {
        registry: ConnectionRegistry::new(),
        router,
        supervisor,
        shutdown: ShutdownCoordinator::new(),
        started_at: Instant::now(),
    }
}

pub fn test_state() -> AppState {
    test_state_with_supervisor(stopped_supervisor())
}

/// Bind an ephemeral port and serve `state` in the background.
pub async fn start_server(state: AppState) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let serve_state = state.clone();
    tokio::spawn(async move {
        server::serve(listener, serve_state, shutdown_rx).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        addr,
        state,
        listener_shutdown: Some(shutdown_tx),
    }
}

/// Connect a WebSocket client to the server's `/ws` endpoint.
pub async fn connect_ws(addr: SocketAddr) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("WebSocket connect should succeed");
    ws
}

/// Receive the next text message and parse it as JSON.
pub async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {other:?}"),
        }
    }
}

/// Try to receive a JSON message within `wait`; `None` if nothing arrived.
pub async fn try_recv_json(ws: &mut WsStream, wait: Duration) -> Option<serde_json::Value> {
    match tokio::time::timeout(wait, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            Some(serde_json::from_str(&text).expect("invalid JSON"))
        }
        _ => None,
    }
}

/// Read messages until one of `kind` arrives, skipping everything else.
pub async fn recv_until_kind(ws: &mut WsStream, kind: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for a '{kind}' message"
        );
        let msg = recv_json(ws).await;
        if msg["type"] == kind {
            return msg;
        }
    }
}
