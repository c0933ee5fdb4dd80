//! HTTP/WebSocket accept boundary.
//!
//! Wires the registry, router, supervisor, and shutdown coordinator into an
//! axum application: `/health` and `/status` for probes, `/ws` for the
//! persistent dashboard connections. Each upgraded socket becomes a
//! registered [`Connection`] driven by one task that multiplexes outbound
//! messages, inbound dispatch, the shutdown signal, and per-connection
//! cancellation.
//!
//! [`Connection`]: crate::registry::Connection

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::protocol::Envelope;
use crate::registry::{ConnectionRegistry, ConnectionState};
use crate::router::{HandlerContext, HandlerError, HandlerResult, MessageRouter};
use crate::shutdown::ShutdownCoordinator;
use crate::supervisor::IndexerSupervisor;

/// Outbound queue depth per connection. A peer that stops reading fills
/// its queue and starts refusing writes; it is never allowed to stall the
/// sender.
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub router: MessageRouter,
    pub supervisor: IndexerSupervisor,
    pub shutdown: ShutdownCoordinator,
    pub started_at: Instant,
}

/// Build the axum application.
pub fn app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `listener` until the shutdown channel fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown_rx: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let app = app(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
}

/// Emit a metrics event on the registry channel at a fixed interval until
/// shutdown begins.
pub fn spawn_metrics_task(
    registry: ConnectionRegistry,
    shutdown: ShutdownCoordinator,
    started_at: Instant,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip the first immediate tick.
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    registry.emit_metrics(started_at.elapsed());
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    Json(serde_json::json!({
        "hostname": host,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "connections": state.registry.len(),
        "worker": state.supervisor.status(),
    }))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Previous session token presented by a reconnecting peer.
    session: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.registry.is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, remote_addr, user_agent, query.session)
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    remote_addr: SocketAddr,
    user_agent: Option<String>,
    previous_session: Option<String>,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_CAPACITY);
    let connection = match state.registry.add(remote_addr, user_agent, outbound_tx) {
        Ok(connection) => connection,
        Err(_) => {
            // Raced with shutdown between the upgrade check and add().
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: "server is shutting down".into(),
                })))
                .await;
            return;
        }
    };
    tracing::info!(id = %connection.id, addr = %remote_addr, "connection accepted");

    // Session bootstrap: first message on every connection.
    let session = connection.ensure_session(previous_session.as_deref());
    connection.try_send(Envelope::session_created(&session));

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut shutdown_rx = state.shutdown.subscribe();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        if ws_tx
                            .send(Message::Text(envelope.to_json().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        connection.activity.touch();
                        match Envelope::parse(&text) {
                            Ok(envelope) => {
                                let ctx = HandlerContext {
                                    connection: connection.clone(),
                                    registry: state.registry.clone(),
                                };
                                let router = state.router.clone();
                                let conn = connection.clone();
                                // Handlers interleave; per-connection ordering
                                // is each handler's own concern.
                                tokio::spawn(async move {
                                    let kind = envelope.kind.clone();
                                    let outcome = router.dispatch(ctx, envelope).await;
                                    if outcome.is_unknown_type() {
                                        conn.try_send(Envelope::error(format!(
                                            "unsupported message type '{kind}'"
                                        )));
                                    }
                                });
                            }
                            Err(e) => {
                                connection
                                    .try_send(Envelope::error(format!("malformed message: {e}")));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        connection.activity.touch();
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(id = %connection.id, "closing on shutdown signal");
                    send_close(&mut ws_tx, "server shutting down").await;
                    break;
                }
            }

            _ = connection.cancelled.cancelled() => {
                send_close(&mut ws_tx, "connection closed").await;
                break;
            }
        }
    }

    connection.set_state(ConnectionState::Closing);
    state.registry.remove(connection.id);
    tracing::info!(id = %connection.id, "connection closed");
}

async fn send_close(ws_tx: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: reason.to_string().into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}

/// Register the built-in message handlers.
///
/// Worker-backed types capture the supervisor handle at registration time;
/// the router itself stays decoupled from it.
pub fn register_builtin_handlers(router: &MessageRouter, supervisor: &IndexerSupervisor) {
    router.register("ping", |_ctx, _env| async {
        Ok(Some(Envelope::event("pong")))
    });

    router.register("echo", |_ctx, env: Envelope| async move {
        Ok(Some(Envelope::with_data(
            "echo_response",
            env.data.unwrap_or(serde_json::Value::Null),
        )))
    });

    router.register("broadcast", |ctx: HandlerContext, env: Envelope| async move {
        let relay = Envelope::broadcast_from(ctx.connection.id, env.data);
        let recipients = ctx.registry.broadcast(&relay, &[ctx.connection.id]);
        Ok(Some(Envelope::with_data(
            "broadcast_sent",
            serde_json::json!({ "recipients": recipients }),
        )))
    });

    let status_supervisor = supervisor.clone();
    router.register("status", move |ctx: HandlerContext, _env| {
        let supervisor = status_supervisor.clone();
        async move {
            Ok(Some(Envelope::with_data(
                "status",
                serde_json::json!({
                    "connections": ctx.registry.len(),
                    "worker": supervisor.status(),
                }),
            )))
        }
    });

    let query_supervisor = supervisor.clone();
    router.register("log_query", move |_ctx, env: Envelope| {
        let supervisor = query_supervisor.clone();
        async move { worker_call(supervisor, "query", env).await }
    });

    let tail_supervisor = supervisor.clone();
    router.register("log_tail", move |_ctx, env: Envelope| {
        let supervisor = tail_supervisor.clone();
        async move { worker_call(supervisor, "tail", env).await }
    });
}

/// Forward a worker-backed message as a JSON-RPC call.
///
/// When the worker is not healthy the reply is an explicit reduced-mode
/// payload rather than an opaque failure; the rest of the server keeps
/// serving normally.
async fn worker_call(
    supervisor: IndexerSupervisor,
    method: &str,
    env: Envelope,
) -> HandlerResult {
    let reply_kind = format!("{}_response", env.kind);
    if supervisor.is_degraded() {
        return Ok(Some(Envelope::with_data(
            reply_kind,
            serde_json::json!({
                "degraded": true,
                "message": "log index is unavailable, serving without indexed results",
            }),
        )));
    }
    let params = env.data.unwrap_or_else(|| serde_json::json!({}));
    match supervisor.rpc(method, params).await {
        Ok(result) => Ok(Some(Envelope::with_data(reply_kind, result))),
        Err(e) => Err(HandlerError::Failed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::WorkerConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for oneshot()

    fn test_supervisor() -> IndexerSupervisor {
        IndexerSupervisor::new(WorkerConfig::new(
            "/nonexistent/logdeck-indexer".into(),
            "127.0.0.1".into(),
            0,
            std::env::temp_dir(),
        ))
    }

    fn test_state() -> AppState {
        let router = MessageRouter::new();
        let supervisor = test_supervisor();
        register_builtin_handlers(&router, &supervisor);
        AppState {
            registry: ConnectionRegistry::new(),
            router,
            supervisor,
            shutdown: ShutdownCoordinator::new(),
            started_at: Instant::now(),
        }
    }

    fn test_ctx(state: &AppState) -> (HandlerContext, mpsc::Receiver<Envelope>) {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let (tx, rx) = mpsc::channel(8);
        let connection = state.registry.add(addr, None, tx).unwrap();
        (
            HandlerContext {
                connection,
                registry: state.registry.clone(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = app(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_worker_and_connections() {
        let state = test_state();
        let (_ctx, _rx) = test_ctx(&state);
        let app = app(state);

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["connections"], 1);
        assert_eq!(body["worker"]["state"], "stopped");
        assert_eq!(body["worker"]["degraded"], true);
        assert!(body["uptime_seconds"].is_number());
        assert!(body["hostname"].is_string());
    }

    #[tokio::test]
    async fn ws_upgrade_refused_while_draining() {
        let state = test_state();
        state.registry.close();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(serve(listener, state, shutdown_rx));

        let result =
            tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503);
            }
            other => panic!("expected HTTP 503 refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_handler_replies_pong() {
        let state = test_state();
        let (ctx, mut rx) = test_ctx(&state);

        state.router.dispatch(ctx, Envelope::event("ping")).await;
        assert_eq!(rx.try_recv().unwrap().kind, "pong");
    }

    #[tokio::test]
    async fn echo_handler_returns_payload() {
        let state = test_state();
        let (ctx, mut rx) = test_ctx(&state);

        state
            .router
            .dispatch(ctx, Envelope::with_data("echo", serde_json::json!("hi")))
            .await;
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.kind, "echo_response");
        assert_eq!(reply.data, Some(serde_json::json!("hi")));
    }

    #[tokio::test]
    async fn broadcast_handler_excludes_sender() {
        let state = test_state();
        let (ctx_a, mut rx_a) = test_ctx(&state);
        let (ctx_b, mut rx_b) = test_ctx(&state);

        state
            .router
            .dispatch(
                ctx_a.clone(),
                Envelope::with_data("broadcast", serde_json::json!("x")),
            )
            .await;

        // B receives the relay with the sender's id.
        let relay = rx_b.try_recv().expect("other peer should receive");
        assert_eq!(relay.kind, "broadcast");
        let data = relay.data.unwrap();
        assert_eq!(data["from"], serde_json::json!(ctx_a.connection.id));
        assert_eq!(data["data"], "x");

        // A only gets the ack, never its own broadcast.
        let ack = rx_a.try_recv().unwrap();
        assert_eq!(ack.kind, "broadcast_sent");
        assert_eq!(ack.data.unwrap()["recipients"], 1);
        assert!(rx_a.try_recv().is_err());

        drop(ctx_b);
    }

    #[tokio::test]
    async fn status_handler_reports_degraded_worker() {
        let state = test_state();
        let (ctx, mut rx) = test_ctx(&state);

        state.router.dispatch(ctx, Envelope::event("status")).await;
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.kind, "status");
        let data = reply.data.unwrap();
        assert_eq!(data["worker"]["degraded"], true);
    }

    #[tokio::test]
    async fn log_query_degrades_instead_of_failing() {
        let state = test_state();
        let (ctx, mut rx) = test_ctx(&state);

        let outcome = state
            .router
            .dispatch(
                ctx,
                Envelope::with_data("log_query", serde_json::json!({ "q": "error" })),
            )
            .await;
        assert!(outcome.delivered, "degraded mode is a reply, not a failure");

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.kind, "log_query_response");
        assert_eq!(reply.data.unwrap()["degraded"], true);
    }

    #[tokio::test]
    async fn unknown_type_outcome_is_surfaced() {
        let state = test_state();
        let (ctx, _rx) = test_ctx(&state);

        let outcome = state
            .router
            .dispatch(ctx, Envelope::event("definitely_not_registered"))
            .await;
        assert!(outcome.is_unknown_type());
    }
}
