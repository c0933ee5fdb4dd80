//! Reconnecting dashboard client.
//!
//! The peer-side half of the connection contract: a WebSocket client that
//! manages its own connect/retry/heartbeat cycle independently of the
//! server. The browser dashboard runs the same state machine; this one
//! backs the `logdeck watch` CLI and the integration tests.
//!
//! States: `Disconnected → Connecting → Connected`, with `Connected`
//! looping on a send-only heartbeat ping. An unrequested transport close
//! schedules a reconnect with exponential backoff until the attempt cap,
//! then gives up and stays `Disconnected` until told to connect again.
//! An explicit `disconnect()` suppresses reconnection entirely.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observable state-machine transitions, for UI/logging without polling.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// About to dial. `attempt` is the number of consecutive failures so
    /// far (0 on the initial connect).
    Connecting { attempt: u32 },
    Connected,
    HeartbeatSent,
    Disconnected { reason: String },
    RetryScheduled { attempt: u32, delay: Duration },
    /// The attempt cap was reached; no further retries will be scheduled.
    GaveUp,
}

/// Timing knobs for the reconnect cycle.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub backoff_base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before retry `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Handle over the client task.
pub struct ReconnectingClient {
    state_rx: watch::Receiver<ClientState>,
    events_tx: broadcast::Sender<ClientEvent>,
    messages_tx: broadcast::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReconnectingClient {
    /// Start connecting to `url`. The returned handle observes and
    /// controls the background task driving the state machine.
    pub fn connect(url: String, policy: ReconnectPolicy) -> Self {
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (events_tx, _) = broadcast::channel(64);
        let (messages_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connection_loop(
            url,
            policy,
            state_tx,
            events_tx.clone(),
            messages_tx.clone(),
            shutdown_rx,
        ));
        Self {
            state_rx,
            events_tx,
            messages_tx,
            shutdown_tx,
            task,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    /// Subscribe to state-machine transition events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe to inbound text messages from the server.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<String> {
        self.messages_tx.subscribe()
    }

    /// Clean shutdown: close the transport and suppress reconnection.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the client task to finish. Consumes the handle.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn connection_loop(
    url: String,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ClientState>,
    events_tx: broadcast::Sender<ClientEvent>,
    messages_tx: broadcast::Sender<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Consecutive failed attempts since the last successful connection.
    let mut failures: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            let _ = state_tx.send_replace(ClientState::Disconnected);
            return;
        }

        let _ = state_tx.send_replace(ClientState::Connecting);
        let _ = events_tx.send(ClientEvent::Connecting { attempt: failures });

        let connect = tokio::time::timeout(
            policy.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        match connect.await {
            Ok(Ok((ws_stream, _))) => {
                failures = 0;
                let _ = state_tx.send_replace(ClientState::Connected);
                let _ = events_tx.send(ClientEvent::Connected);
                tracing::info!(%url, "connected");

                let reason = run_connection(
                    ws_stream,
                    &policy,
                    &events_tx,
                    &messages_tx,
                    &mut shutdown_rx,
                )
                .await;

                let _ = state_tx.send_replace(ClientState::Disconnected);
                let _ = events_tx.send(ClientEvent::Disconnected { reason: reason.clone() });
                if *shutdown_rx.borrow() {
                    return;
                }
                tracing::warn!(%url, reason, "connection lost");
            }
            Ok(Err(e)) => {
                let _ = state_tx.send_replace(ClientState::Disconnected);
                let _ = events_tx.send(ClientEvent::Disconnected { reason: e.to_string() });
                tracing::debug!(%url, error = %e, "connect failed");
            }
            Err(_) => {
                let _ = state_tx.send_replace(ClientState::Disconnected);
                let _ = events_tx.send(ClientEvent::Disconnected {
                    reason: "connect timeout".into(),
                });
                tracing::debug!(%url, "connect timed out");
            }
        }

        failures += 1;
        if failures > policy.max_attempts {
            tracing::warn!(%url, attempts = policy.max_attempts, "giving up on reconnection");
            let _ = events_tx.send(ClientEvent::GaveUp);
            return;
        }

        let delay = policy.delay_for(failures);
        let _ = events_tx.send(ClientEvent::RetryScheduled { attempt: failures, delay });
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                let _ = state_tx.send_replace(ClientState::Disconnected);
                return;
            }
        }
    }
}

/// Drive one established connection until it closes. Returns the reason.
async fn run_connection(
    ws_stream: WsStream,
    policy: &ReconnectPolicy,
    events_tx: &broadcast::Sender<ClientEvent>,
    messages_tx: &broadcast::Sender<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> String {
    let (mut sink, mut stream) = ws_stream.split();
    let mut heartbeat = tokio::time::interval(policy.heartbeat_interval);
    heartbeat.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = messages_tx.send(text.to_string());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return "transport error".into();
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Heartbeat is send-only; pongs are irrelevant.
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return "closed by server".into();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return e.to_string(),
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    return "transport error".into();
                }
                let _ = events_tx.send(ClientEvent::HeartbeatSent);
            }
            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return "requested".into();
            }
        }
    }
}
