//! Lifecycle supervision for the out-of-process log-indexing worker.
//!
//! The supervisor owns exactly one worker: it discovers whether the target
//! port is already served, adopts a healthy listener instead of spawning a
//! duplicate, remediates an unhealthy port squatter once, spawns the worker
//! with explicit address arguments, polls it to health under a bounded
//! budget, and tears it down graceful-then-forceful. A worker that dies or
//! goes unhealthy after startup flips the server into degraded mode — it is
//! never auto-restarted.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Worker lifecycle states.
///
/// `Stopped → Starting → Healthy` on the happy path; `Starting → Stopped`
/// on startup failure; `Healthy → Unhealthy` when post-startup probes fail
/// (degraded, no auto-restart); `Healthy/Unhealthy → Stopping → Stopped`
/// at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
}

/// Static configuration for the supervised worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker executable.
    pub command: PathBuf,
    /// Address the worker is told to listen on.
    pub host: String,
    pub port: u16,
    /// Index storage directory; also the worker's working directory.
    pub data_dir: PathBuf,
    /// Interval between startup health probes.
    pub health_interval: Duration,
    /// Maximum startup health probes before giving up.
    pub health_attempts: u32,
    /// Per-probe HTTP timeout.
    pub health_timeout: Duration,
    /// How long the worker gets to exit after SIGTERM before SIGKILL.
    pub stop_grace: Duration,
    /// Pause after terminating a port squatter, before spawning.
    pub conflict_grace: Duration,
    /// Interval between post-startup health probes.
    pub watch_interval: Duration,
    /// Consecutive post-startup probe failures before degrading.
    pub watch_failure_budget: u32,
}

impl WorkerConfig {
    pub fn new(command: PathBuf, host: String, port: u16, data_dir: PathBuf) -> Self {
        Self {
            command,
            host,
            port,
            data_dir,
            health_interval: Duration::from_millis(500),
            health_attempts: 20,
            health_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_secs(3),
            conflict_grace: Duration::from_secs(1),
            watch_interval: Duration::from_secs(5),
            watch_failure_budget: 3,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker did not become healthy within {attempts} probes")]
    StartupTimeout { attempts: u32 },
    #[error("worker is already running")]
    AlreadyRunning,
    #[error("worker rpc failed: {0}")]
    Rpc(String),
}

/// Point-in-time view of the worker, for `/status` and the `status` message.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub host: String,
    pub port: u16,
    pub restart_count: u32,
    pub adopted: bool,
    pub degraded: bool,
}

struct SupervisorInner {
    config: WorkerConfig,
    state_tx: watch::Sender<WorkerState>,
    pid: RwLock<Option<u32>>,
    /// Total spawns over the supervisor's lifetime; restart_count derives
    /// from it.
    spawns: AtomicU32,
    adopted: AtomicBool,
    /// Set by the wait task when the child exits. Checked before signaling
    /// so a recycled PID is never hit.
    child_exited: AtomicBool,
    exit_tx: watch::Sender<bool>,
    http: reqwest::Client,
    watch_cancel: Mutex<CancellationToken>,
}

/// Cloneable handle over the supervised worker.
#[derive(Clone)]
pub struct IndexerSupervisor {
    inner: Arc<SupervisorInner>,
}

impl IndexerSupervisor {
    pub fn new(config: WorkerConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.health_timeout)
            .timeout(config.health_timeout)
            .build()
            .unwrap_or_default();
        let (state_tx, _) = watch::channel(WorkerState::Stopped);
        let (exit_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                state_tx,
                pid: RwLock::new(None),
                spawns: AtomicU32::new(0),
                adopted: AtomicBool::new(false),
                child_exited: AtomicBool::new(false),
                exit_tx,
                http,
                watch_cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to worker state transitions.
    pub fn state_watch(&self) -> watch::Receiver<WorkerState> {
        self.inner.state_tx.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.read()
    }

    /// Spawns beyond the first; observability only.
    pub fn restart_count(&self) -> u32 {
        self.inner.spawns.load(Ordering::Acquire).saturating_sub(1)
    }

    /// True whenever the worker-backed features are unavailable.
    pub fn is_degraded(&self) -> bool {
        self.state() != WorkerState::Healthy
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            state: self.state(),
            pid: self.pid(),
            host: self.inner.config.host.clone(),
            port: self.inner.config.port,
            restart_count: self.restart_count(),
            adopted: self.inner.adopted.load(Ordering::Acquire),
            degraded: self.is_degraded(),
        }
    }

    fn set_state(&self, state: WorkerState) {
        let _ = self.inner.state_tx.send_replace(state);
    }

    /// Bring the worker up.
    ///
    /// 1. If the target port already answers `/health` with 200, adopt the
    ///    listener — no spawn, straight to `Healthy`.
    /// 2. If the port is bound but unhealthy, terminate the owner (one
    ///    attempt), wait a short grace, and fall through to spawn.
    /// 3. Spawn the worker and poll `/health` up to the configured budget.
    ///
    /// Startup failure is non-fatal to the server: the worker is torn down,
    /// state returns to `Stopped`, and the caller keeps running degraded.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let won = self.inner.state_tx.send_if_modified(|state| {
            if *state == WorkerState::Stopped {
                *state = WorkerState::Starting;
                true
            } else {
                false
            }
        });
        if !won {
            return Err(SupervisorError::AlreadyRunning);
        }

        self.inner.child_exited.store(false, Ordering::Release);
        self.inner.adopted.store(false, Ordering::Release);
        let _ = self.inner.exit_tx.send_replace(false);

        let config = self.inner.config.clone();
        if self.port_is_bound().await {
            if self.health_ok().await {
                tracing::info!(
                    port = config.port,
                    "adopting healthy listener already on worker port"
                );
                self.inner.adopted.store(true, Ordering::Release);
                self.set_state(WorkerState::Healthy);
                self.spawn_health_watch();
                return Ok(());
            }
            tracing::warn!(
                port = config.port,
                "worker port is bound but unhealthy, terminating owner"
            );
            self.terminate_port_owner().await;
            tokio::time::sleep(config.conflict_grace).await;
        }

        if let Err(e) = self.spawn_worker().await {
            self.set_state(WorkerState::Stopped);
            return Err(e);
        }

        for attempt in 1..=config.health_attempts {
            if self.health_ok().await {
                tracing::info!(attempt, "worker is healthy");
                self.set_state(WorkerState::Healthy);
                self.spawn_health_watch();
                return Ok(());
            }
            if self.inner.child_exited.load(Ordering::Acquire) {
                tracing::warn!("worker exited before becoming healthy");
                break;
            }
            tokio::time::sleep(config.health_interval).await;
        }

        tracing::warn!(
            attempts = config.health_attempts,
            "worker never became healthy, giving up on startup"
        );
        self.terminate_child().await;
        self.set_state(WorkerState::Stopped);
        Err(SupervisorError::StartupTimeout {
            attempts: config.health_attempts,
        })
    }

    /// Tear the worker down: SIGTERM, bounded wait, SIGKILL.
    ///
    /// Idempotent and safe when the worker was never started. An adopted
    /// listener is never signaled — it is not ours to kill.
    pub async fn stop(&self) {
        let state = self.state();
        if matches!(state, WorkerState::Stopped | WorkerState::Stopping) {
            return;
        }
        self.inner.watch_cancel.lock().cancel();

        if self.inner.adopted.load(Ordering::Acquire) {
            tracing::debug!("releasing adopted worker without signaling it");
            self.inner.adopted.store(false, Ordering::Release);
            self.set_state(WorkerState::Stopped);
            return;
        }

        self.set_state(WorkerState::Stopping);
        self.terminate_child().await;
        self.set_state(WorkerState::Stopped);
    }

    /// Issue a JSON-RPC call against the worker (e.g. `log`, `query`).
    ///
    /// Only the success/failure/timeout outcome matters to this core; the
    /// response body is passed through untouched.
    pub async fn rpc(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SupervisorError> {
        if self.is_degraded() {
            return Err(SupervisorError::Rpc("worker is not healthy".into()));
        }
        let url = format!("{}/rpc", self.inner.config.base_url());
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let resp = self
            .inner
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SupervisorError::Rpc(e.to_string()))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(SupervisorError::Rpc(format!(
                "worker returned status {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| SupervisorError::Rpc(e.to_string()))
    }

    // ── internals ──────────────────────────────────────────────────

    async fn port_is_bound(&self) -> bool {
        let addr = format!("{}:{}", self.inner.config.host, self.inner.config.port);
        matches!(
            tokio::time::timeout(
                Duration::from_secs(1),
                tokio::net::TcpStream::connect(&addr),
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// One `/health` probe. Exactly 200 counts as healthy; refusal,
    /// timeout, and every other status are all unhealthy.
    async fn health_ok(&self) -> bool {
        let url = format!("{}/health", self.inner.config.base_url());
        match self.inner.http.get(&url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Terminate whatever owns the worker port. One attempt only; if the
    /// port is still bound afterwards the spawn will fail and the server
    /// continues degraded.
    #[cfg(unix)]
    async fn terminate_port_owner(&self) {
        let port = self.inner.config.port;
        let output = Command::new("lsof")
            .args(["-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                for line in String::from_utf8_lossy(&out.stdout).lines() {
                    if let Ok(pid) = line.trim().parse::<i32>() {
                        tracing::warn!(pid, port, "sending SIGTERM to port owner");
                        unsafe {
                            libc::kill(pid, libc::SIGTERM);
                        }
                    }
                }
            }
            _ => {
                tracing::warn!(port, "could not identify the process holding the worker port");
            }
        }
    }

    #[cfg(not(unix))]
    async fn terminate_port_owner(&self) {
        tracing::warn!("port-owner termination is not supported on this platform");
    }

    async fn spawn_worker(&self) -> Result<(), SupervisorError> {
        let config = &self.inner.config;
        let command_display = config.command.display().to_string();

        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|source| SupervisorError::Spawn {
                command: command_display.clone(),
                source,
            })?;

        let mut cmd = Command::new(&config.command);
        cmd.arg("--host")
            .arg(&config.host)
            .arg("--port")
            .arg(config.port.to_string())
            .arg("--data-dir")
            .arg(&config.data_dir)
            .current_dir(&config.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: command_display.clone(),
            source,
        })?;

        let pid = child.id();
        *self.inner.pid.write() = pid;
        self.inner.spawns.fetch_add(1, Ordering::AcqRel);
        tracing::info!(?pid, command = %command_display, "worker spawned");

        // Worker output goes to our logging sink for diagnostics only —
        // it is never parsed for control decisions.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        // Reap the child and publish its exit. The exited flag is set
        // before the pid is cleared so concurrent signal paths skip a
        // potentially-recycled PID.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(?status, "worker exited"),
                Err(e) => tracing::error!(?e, "error waiting for worker"),
            }
            inner.child_exited.store(true, Ordering::Release);
            *inner.pid.write() = None;
            let _ = inner.exit_tx.send_replace(true);

            let state = *inner.state_tx.borrow();
            if matches!(state, WorkerState::Healthy) {
                tracing::warn!("worker exited unexpectedly, entering degraded mode");
                let _ = inner.state_tx.send_replace(WorkerState::Unhealthy);
            }
        });

        Ok(())
    }

    /// SIGTERM, wait up to the grace window, then SIGKILL.
    async fn terminate_child(&self) {
        let pid = self.pid();
        let Some(pid) = pid else { return };

        self.signal(pid, libc::SIGTERM);
        if !self.wait_exit(self.inner.config.stop_grace).await {
            tracing::warn!(pid, "worker ignored SIGTERM, escalating to SIGKILL");
            self.signal(pid, libc::SIGKILL);
            self.wait_exit(Duration::from_secs(2)).await;
        }
        *self.inner.pid.write() = None;
    }

    fn signal(&self, pid: u32, sig: i32) {
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID out of range, cannot send signal");
            return;
        }
        if self.inner.child_exited.load(Ordering::Acquire) {
            tracing::debug!(pid, "worker already exited, skipping signal");
            return;
        }
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, sig);
        }
    }

    /// Wait for the exit flag, bounded. Returns whether the child exited.
    async fn wait_exit(&self, grace: Duration) -> bool {
        let mut rx = self.inner.exit_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(grace, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Periodic health probing once the worker is up. Flips `Healthy` →
    /// `Unhealthy` after the failure budget (and back on recovery); never
    /// restarts the worker.
    fn spawn_health_watch(&self) {
        let token = CancellationToken::new();
        *self.inner.watch_cancel.lock() = token.clone();

        let supervisor = self.clone();
        tokio::spawn(async move {
            let budget = supervisor.inner.config.watch_failure_budget;
            let interval = supervisor.inner.config.watch_interval;
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !matches!(
                    supervisor.state(),
                    WorkerState::Healthy | WorkerState::Unhealthy
                ) {
                    return;
                }
                if supervisor.health_ok().await {
                    failures = 0;
                    if supervisor.state() == WorkerState::Unhealthy {
                        tracing::info!("worker health restored");
                        supervisor.set_state(WorkerState::Healthy);
                    }
                } else {
                    failures += 1;
                    if failures >= budget && supervisor.state() == WorkerState::Healthy {
                        tracing::warn!(
                            failures,
                            "worker failing health checks, entering degraded mode"
                        );
                        supervisor.set_state(WorkerState::Unhealthy);
                    }
                }
            }
        });
    }
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(stream, "indexer: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn test_config(command: &str, port: u16, data_dir: PathBuf) -> WorkerConfig {
        let mut config = WorkerConfig::new(command.into(), "127.0.0.1".into(), port, data_dir);
        config.health_interval = Duration::from_millis(50);
        config.health_attempts = 3;
        config.health_timeout = Duration::from_millis(500);
        config.stop_grace = Duration::from_millis(500);
        config.conflict_grace = Duration::from_millis(50);
        config
    }

    /// Serve `/health` with 200 on an ephemeral port, returning the port.
    async fn spawn_healthy_stub() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route("/health", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[test]
    fn config_base_url() {
        let config = WorkerConfig::new("idx".into(), "127.0.0.1".into(), 7700, "/tmp".into());
        assert_eq!(config.base_url(), "http://127.0.0.1:7700");
    }

    #[tokio::test]
    async fn initial_state_is_stopped_and_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            IndexerSupervisor::new(test_config("/bin/true", free_port(), dir.path().into()));
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert!(supervisor.is_degraded());
        assert_eq!(supervisor.pid(), None);
        assert_eq!(supervisor.restart_count(), 0);
    }

    #[tokio::test]
    async fn stop_is_safe_when_never_started() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            IndexerSupervisor::new(test_config("/bin/true", free_port(), dir.path().into()));
        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn start_adopts_healthy_listener_without_spawning() {
        let port = spawn_healthy_stub().await;
        let dir = tempfile::tempdir().unwrap();
        // The command does not exist; adoption must succeed without it.
        let supervisor = IndexerSupervisor::new(test_config(
            "/nonexistent/logdeck-indexer",
            port,
            dir.path().into(),
        ));

        supervisor.start().await.expect("adoption should succeed");
        assert_eq!(supervisor.state(), WorkerState::Healthy);
        assert!(!supervisor.is_degraded());
        assert_eq!(supervisor.pid(), None, "adoption must not spawn");
        assert_eq!(supervisor.restart_count(), 0);
        assert!(supervisor.status().adopted);

        // Releasing the adopted listener never signals it; the stub stays up.
        supervisor.stop().await;
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .expect("adopted listener must survive stop()");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn start_fails_when_command_missing() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = IndexerSupervisor::new(test_config(
            "/nonexistent/logdeck-indexer",
            free_port(),
            dir.path().into(),
        ));

        let err = supervisor.start().await.unwrap_err();
        assert!(
            matches!(err, SupervisorError::Spawn { .. }),
            "expected Spawn error, got: {err:?}"
        );
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert!(supervisor.is_degraded());
    }

    #[tokio::test]
    async fn start_times_out_when_worker_never_serves_health() {
        let dir = tempfile::tempdir().unwrap();
        // /bin/true exits immediately without listening; the poll loop
        // notices the exit and gives up early.
        let supervisor =
            IndexerSupervisor::new(test_config("/bin/true", free_port(), dir.path().into()));

        let err = supervisor.start().await.unwrap_err();
        assert!(
            matches!(err, SupervisorError::StartupTimeout { .. }),
            "expected StartupTimeout, got: {err:?}"
        );
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert_eq!(supervisor.pid(), None, "pid must be cleared after reap");
    }

    #[tokio::test]
    async fn start_twice_is_rejected_while_running() {
        let port = spawn_healthy_stub().await;
        let dir = tempfile::tempdir().unwrap();
        let supervisor = IndexerSupervisor::new(test_config(
            "/nonexistent/logdeck-indexer",
            port,
            dir.path().into(),
        ));

        supervisor.start().await.unwrap();
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn restart_count_tracks_spawns_beyond_first() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            IndexerSupervisor::new(test_config("/bin/true", free_port(), dir.path().into()));

        let _ = supervisor.start().await;
        assert_eq!(supervisor.restart_count(), 0, "first spawn is not a restart");
        let _ = supervisor.start().await;
        assert_eq!(supervisor.restart_count(), 1);
    }

    #[tokio::test]
    async fn rpc_refuses_while_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            IndexerSupervisor::new(test_config("/bin/true", free_port(), dir.path().into()));

        let err = supervisor
            .rpc("query", serde_json::json!({ "q": "error" }))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Rpc(_)));
    }

    #[tokio::test]
    async fn state_watch_observes_transitions() {
        let port = spawn_healthy_stub().await;
        let dir = tempfile::tempdir().unwrap();
        let supervisor = IndexerSupervisor::new(test_config(
            "/nonexistent/logdeck-indexer",
            port,
            dir.path().into(),
        ));
        let mut watch = supervisor.state_watch();
        assert_eq!(*watch.borrow(), WorkerState::Stopped);

        supervisor.start().await.unwrap();
        watch
            .wait_for(|s| *s == WorkerState::Healthy)
            .await
            .expect("should observe Healthy");
        supervisor.stop().await;
        watch
            .wait_for(|s| *s == WorkerState::Stopped)
            .await
            .expect("should observe Stopped");
    }
}
