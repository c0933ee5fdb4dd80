//! Connection registry: the authoritative set of live peer connections.
//!
//! Each accepted WebSocket becomes a [`Connection`] registered here for the
//! lifetime of its transport. The registry assigns ids (never reused within
//! a server lifetime), emits lifecycle events consumed by the server's
//! session bootstrap and metrics reporting, and is the first thing closed
//! during shutdown so no new connections slip in mid-drain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::protocol::Envelope;

/// Opaque connection identifier, assigned at accept time.
///
/// Ids come from a monotonically increasing counter and are never reused
/// within a server lifetime, so a stale id can never alias a newer peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Construct an id from its raw value. Test and display plumbing only;
    /// real ids are assigned by [`ConnectionRegistry::add`].
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

/// Application-level context bound to one connection.
///
/// Created lazily on the first successful handshake and sent to the peer as
/// a `session_created` message. Dies with the connection — sessions are
/// never persisted or resurrected; a reconnecting peer presenting its old
/// token gets a fresh session with `reconnection` set.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub reconnection: bool,
}

impl Session {
    fn issue(previous_token: Option<&str>) -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            issued_at: Utc::now(),
            reconnection: previous_token.is_some(),
        }
    }
}

/// Tracks the timestamp of the last activity on a connection.
///
/// Touched on every inbound and outbound message. Read for idle/metrics
/// reporting only — there is no TTL eviction. Each touch bumps a monotonic
/// generation counter so observers can distinguish "still idle" from
/// "active again since I last looked".
#[derive(Clone)]
pub struct ActivityTracker {
    tx: Arc<watch::Sender<Instant>>,
    generation: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity. Safe to call from any task.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.tx.send_replace(Instant::now());
    }

    /// Current generation counter value.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Milliseconds elapsed since the last activity.
    pub fn last_activity_ms(&self) -> u64 {
        self.tx.borrow().elapsed().as_millis() as u64
    }

    /// Subscribe to activity changes.
    pub fn subscribe(&self) -> watch::Receiver<Instant> {
        self.tx.subscribe()
    }
}

/// One live peer channel.
///
/// Cheap to clone; all mutable state is behind shared handles. The outbound
/// sender feeds the connection's socket writer task — a full queue counts
/// as "the connection did not accept the write".
#[derive(Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub user_agent: Option<String>,
    state: Arc<RwLock<ConnectionState>>,
    /// Touched on every inbound/outbound message; metrics only.
    pub activity: ActivityTracker,
    outbound: mpsc::Sender<Envelope>,
    session: Arc<RwLock<Option<Session>>>,
    /// Fires when this connection is removed from the registry. Socket
    /// tasks select on it to send a close frame and exit promptly.
    pub cancelled: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Queue an envelope to the peer.
    ///
    /// Returns `true` when the write was accepted. A `Closing`/`Closed`
    /// connection or a full outbound queue refuses the write; neither is an
    /// error at this layer.
    pub fn try_send(&self, envelope: Envelope) -> bool {
        if !self.is_active() {
            return false;
        }
        let accepted = self.outbound.try_send(envelope).is_ok();
        if accepted {
            self.activity.touch();
        }
        accepted
    }

    /// Return the session, creating it on first call.
    ///
    /// `previous_token` is the token a reconnecting peer presented; it only
    /// flips the `reconnection` flag — the old session itself is gone.
    pub fn ensure_session(&self, previous_token: Option<&str>) -> Session {
        let mut slot = self.session.write();
        match &*slot {
            Some(session) => session.clone(),
            None => {
                let session = Session::issue(previous_token);
                *slot = Some(session.clone());
                session
            }
        }
    }

    /// The current session, if the handshake has completed.
    pub fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }
}

/// Registry lifecycle events, consumed by the server's session-bootstrap
/// logic and by metrics collection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Added { id: ConnectionId },
    Removed { id: ConnectionId },
    /// Periodic snapshot emitted by the server's metrics task.
    Metrics {
        connections: usize,
        /// Connections with no traffic for over a minute. Reporting only —
        /// idle connections are never evicted.
        idle: usize,
        uptime_seconds: u64,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry is draining or terminated; the caller must refuse the
    /// connection.
    #[error("registry closed to new connections")]
    Closed,
}

struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    next_id: u64,
}

/// Tracks all live connections by id.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    closed: Arc<AtomicBool>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry with a broadcast channel for lifecycle events.
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                connections: HashMap::new(),
                next_id: 0,
            })),
            closed: Arc::new(AtomicBool::new(false)),
            events_tx,
        }
    }

    /// Register a new connection and assign it an id.
    ///
    /// O(1). Fails with [`RegistryError::Closed`] once [`close`] has been
    /// called — the accept path must then refuse the peer. Emits
    /// `ConnectionEvent::Added` on success.
    ///
    /// [`close`]: ConnectionRegistry::close
    pub fn add(
        &self,
        remote_addr: SocketAddr,
        user_agent: Option<String>,
        outbound: mpsc::Sender<Envelope>,
    ) -> Result<Connection, RegistryError> {
        let mut inner = self.inner.write();

        // Re-checked under the write lock: close() also takes it, so a
        // connection can never be added after drain has snapshotted.
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }

        let id = ConnectionId(inner.next_id);
        inner.next_id += 1;

        let connection = Connection {
            id,
            remote_addr,
            user_agent,
            state: Arc::new(RwLock::new(ConnectionState::Active)),
            activity: ActivityTracker::new(),
            outbound,
            session: Arc::new(RwLock::new(None)),
            cancelled: CancellationToken::new(),
        };
        inner.connections.insert(id, connection.clone());
        drop(inner);

        let _ = self.events_tx.send(ConnectionEvent::Added { id });
        Ok(connection)
    }

    /// Remove a connection by id, returning it if it was present.
    ///
    /// Idempotent: removing an unknown id is a no-op. Emits
    /// `ConnectionEvent::Removed` and cancels the connection's token when a
    /// connection is actually removed.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let removed = self.inner.write().connections.remove(&id);
        if let Some(ref connection) = removed {
            connection.set_state(ConnectionState::Closed);
            connection.cancelled.cancel();
            let _ = self.events_tx.send(ConnectionEvent::Removed { id });
        }
        removed
    }

    /// Look up a connection by id.
    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.read().connections.get(&id).cloned()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all current connections.
    ///
    /// Connections added or removed after the snapshot is taken are
    /// unaffected by whatever the caller does with it.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.inner.read().connections.values().cloned().collect()
    }

    /// Visit every connection in a snapshot.
    pub fn for_each(&self, mut f: impl FnMut(&Connection)) {
        for connection in self.snapshot() {
            f(&connection);
        }
    }

    /// Queue `envelope` to every active connection not in `exclude`.
    ///
    /// Iterates a snapshot, so connections added or removed during the
    /// broadcast are unaffected by this call. `Closing`/`Closed`
    /// connections are skipped silently. Returns the number of connections
    /// that accepted the write.
    pub fn broadcast(&self, envelope: &Envelope, exclude: &[ConnectionId]) -> usize {
        let mut sent = 0;
        for connection in self.snapshot() {
            if exclude.contains(&connection.id) {
                continue;
            }
            if connection.try_send(envelope.clone()) {
                sent += 1;
            }
        }
        sent
    }

    /// Stop accepting new connections. Existing connections are untouched.
    pub fn close(&self) {
        // Taken for writing so close() serializes against in-flight add()s.
        let _inner = self.inner.write();
        self.closed.store(true, Ordering::Release);
    }

    /// True once [`close`] or [`drain`] has been called.
    ///
    /// [`close`]: ConnectionRegistry::close
    /// [`drain`]: ConnectionRegistry::drain
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the registry and remove every connection, telling each one to
    /// shut its transport down.
    ///
    /// Cancelling the per-connection token makes the socket task send a
    /// close frame and exit; this method itself never waits on peers.
    /// Returns the number of connections drained.
    pub fn drain(&self) -> usize {
        let drained: Vec<Connection> = {
            let mut inner = self.inner.write();
            self.closed.store(true, Ordering::Release);
            inner.connections.drain().map(|(_, c)| c).collect()
        };
        for connection in &drained {
            connection.set_state(ConnectionState::Closing);
            connection.cancelled.cancel();
            let _ = self.events_tx.send(ConnectionEvent::Removed { id: connection.id });
        }
        drained.len()
    }

    /// Subscribe to lifecycle and metrics events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Emit a periodic metrics event. Called by the server's metrics task.
    pub fn emit_metrics(&self, uptime: std::time::Duration) {
        const IDLE_THRESHOLD_MS: u64 = 60_000;
        let snapshot = self.snapshot();
        let idle = snapshot
            .iter()
            .filter(|c| c.activity.last_activity_ms() > IDLE_THRESHOLD_MS)
            .count();
        let _ = self.events_tx.send(ConnectionEvent::Metrics {
            connections: snapshot.len(),
            idle,
            uptime_seconds: uptime.as_secs(),
        });
    }
}
