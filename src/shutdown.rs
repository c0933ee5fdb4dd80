//! Coordinated teardown of the whole process tree.
//!
//! Every termination trigger — OS signals, fatal panics, server task
//! failure — funnels into one `shutdown(reason)` entry point. A single
//! atomic check-and-set on the process-wide [`ShutdownState`] guarantees
//! the teardown sequence runs exactly once no matter how many triggers
//! arrive, and a detached watchdog forces a non-zero exit if the sequence
//! ever hangs.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::registry::ConnectionRegistry;
use crate::supervisor::IndexerSupervisor;

/// Process-wide shutdown phase. Set once, never reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Idle = 0,
    Draining = 1,
    Terminated = 2,
}

/// Cloneable handle over the shutdown flag.
///
/// Long-lived tasks (WebSocket handlers, the accept loop, the metrics
/// task) subscribe to the signal and wind down when it flips.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<AtomicU8>,
    signal: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            state: Arc::new(AtomicU8::new(ShutdownState::Idle as u8)),
            signal: Arc::new(signal),
        }
    }

    pub fn state(&self) -> ShutdownState {
        match self.state.load(Ordering::Acquire) {
            0 => ShutdownState::Idle,
            1 => ShutdownState::Draining,
            _ => ShutdownState::Terminated,
        }
    }

    /// Claim the teardown sequence.
    ///
    /// Returns `true` for exactly one caller — the atomic check-and-set
    /// from `Idle` to `Draining`. Every other concurrent or later trigger
    /// gets `false` and must not run the sequence.
    pub fn begin(&self, reason: &str) -> bool {
        let won = self
            .state
            .compare_exchange(
                ShutdownState::Idle as u8,
                ShutdownState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            tracing::info!(reason, "shutdown initiated");
            let _ = self.signal.send_replace(true);
        } else {
            tracing::debug!(reason, "duplicate shutdown trigger ignored");
        }
        won
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Idle
    }

    fn mark_terminated(&self) {
        self.state
            .store(ShutdownState::Terminated as u8, Ordering::Release);
    }

    /// Subscribe to the shutdown signal; the value flips to `true` once.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}

/// Default absolute deadline for the whole teardown sequence.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(30);

/// Pause after draining so connection tasks can flush close frames.
const CLOSE_FLUSH: Duration = Duration::from_millis(100);

/// Deadline for the worker's graceful-then-forceful stop.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the teardown sequence over the components it owns handles to.
pub struct Orchestrator {
    coordinator: ShutdownCoordinator,
    registry: ConnectionRegistry,
    supervisor: IndexerSupervisor,
    listener_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    watchdog: Duration,
}

impl Orchestrator {
    pub fn new(
        coordinator: ShutdownCoordinator,
        registry: ConnectionRegistry,
        supervisor: IndexerSupervisor,
        listener_shutdown: oneshot::Sender<()>,
        watchdog: Duration,
    ) -> Self {
        Self {
            coordinator,
            registry,
            supervisor,
            listener_shutdown: Mutex::new(Some(listener_shutdown)),
            watchdog,
        }
    }

    /// Run the teardown sequence. Returns the process exit code.
    ///
    /// Steps, each best-effort and independently bounded:
    /// 1. close the registry (no new connections),
    /// 2. drain live connections (close frames, no waiting on slow peers),
    /// 3. stop the worker graceful-then-forceful,
    /// 4. close the listening socket,
    /// 5. leave log flushing to the writer guard dropped at process exit.
    ///
    /// Duplicate or concurrent calls return immediately; the first caller
    /// owns the sequence. The watchdog spawned here is the only
    /// non-cancellable timer in the process — if the sequence hangs past
    /// the deadline the process exits 1 regardless of progress.
    pub async fn shutdown(&self, reason: &str) -> i32 {
        if !self.coordinator.begin(reason) {
            return 0;
        }

        let watchdog = self.watchdog;
        tokio::spawn(async move {
            tokio::time::sleep(watchdog).await;
            tracing::error!(?watchdog, "shutdown watchdog fired, forcing exit");
            std::process::exit(1);
        });

        let mut failed = false;

        self.registry.close();

        let drained = self.registry.drain();
        tracing::info!(connections = drained, "connections told to close");
        tokio::time::sleep(CLOSE_FLUSH).await;

        match tokio::time::timeout(WORKER_STOP_TIMEOUT, self.supervisor.stop()).await {
            Ok(()) => {}
            Err(_) => {
                tracing::warn!("worker stop exceeded its deadline");
                failed = true;
            }
        }

        if let Some(tx) = self.listener_shutdown.lock().take() {
            let _ = tx.send(());
        }

        self.coordinator.mark_terminated();
        tracing::info!(reason, "shutdown complete");
        if failed {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::WorkerConfig;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn test_supervisor() -> IndexerSupervisor {
        IndexerSupervisor::new(WorkerConfig::new(
            "/bin/true".into(),
            "127.0.0.1".into(),
            0,
            std::env::temp_dir(),
        ))
    }

    fn test_orchestrator(
        registry: ConnectionRegistry,
    ) -> (Arc<Orchestrator>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let orchestrator = Arc::new(Orchestrator::new(
            ShutdownCoordinator::new(),
            registry,
            test_supervisor(),
            tx,
            DEFAULT_WATCHDOG,
        ));
        (orchestrator, rx)
    }

    #[test]
    fn coordinator_begins_exactly_once() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.state(), ShutdownState::Idle);

        assert!(coordinator.begin("first"));
        assert!(!coordinator.begin("second"));
        assert!(!coordinator.begin("third"));
        assert_eq!(coordinator.state(), ShutdownState::Draining);
    }

    #[test]
    fn coordinator_clones_share_state() {
        let a = ShutdownCoordinator::new();
        let b = a.clone();
        assert!(a.begin("signal"));
        assert!(b.is_shutting_down());
        assert!(!b.begin("dup"));
    }

    #[tokio::test]
    async fn subscribers_observe_the_signal() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        assert!(!*rx.borrow());

        coordinator.begin("test");
        rx.changed().await.expect("signal should flip");
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn shutdown_drains_registry_and_closes_listener() {
        let registry = ConnectionRegistry::new();
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        registry.add(addr, None, tx).unwrap();

        let (orchestrator, listener_rx) = test_orchestrator(registry.clone());
        let code = orchestrator.shutdown("test").await;

        assert_eq!(code, 0);
        assert!(registry.is_empty());
        assert!(registry.is_closed());
        listener_rx.await.expect("listener shutdown should be signaled");
    }

    #[tokio::test]
    async fn concurrent_shutdown_runs_sequence_once() {
        let registry = ConnectionRegistry::new();
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        registry.add(addr, None, tx).unwrap();

        let mut events = registry.subscribe_events();
        let (orchestrator, _listener_rx) = test_orchestrator(registry.clone());

        let a = orchestrator.clone();
        let b = orchestrator.clone();
        let (code_a, code_b) = tokio::join!(
            async move { a.shutdown("trigger-a").await },
            async move { b.shutdown("trigger-b").await },
        );
        assert_eq!(code_a.min(code_b), 0);

        // Drain the Added event, then expect exactly one Removed.
        let mut removed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, crate::registry::ConnectionEvent::Removed { .. }) {
                removed += 1;
            }
        }
        assert_eq!(removed, 1, "teardown must run exactly once");
    }

    #[tokio::test]
    async fn shutdown_after_completion_is_a_no_op() {
        let (orchestrator, _listener_rx) = test_orchestrator(ConnectionRegistry::new());
        assert_eq!(orchestrator.shutdown("first").await, 0);
        assert_eq!(orchestrator.shutdown("again").await, 0);
        assert_eq!(
            orchestrator.coordinator.state(),
            ShutdownState::Terminated
        );
    }
}
