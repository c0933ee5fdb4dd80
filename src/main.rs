//! logdeck - realtime log dashboard server
//!
//! ## Modes
//!
//! **`logdeck serve`** (also the default with no subcommand): runs the
//! HTTP/WebSocket server, supervises the log-indexing worker, and handles
//! graceful shutdown on SIGTERM/SIGINT.
//!
//! **`logdeck watch`**: connects to a running server as a reconnecting
//! client and prints incoming messages — a thin terminal dashboard.
//!
//! **`logdeck status`**: queries a running server's `/status` endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser as ClapParser, Subcommand};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logdeck::{
    client::{ClientEvent, ReconnectPolicy, ReconnectingClient},
    config,
    registry::ConnectionRegistry,
    router::MessageRouter,
    server,
    shutdown::{Orchestrator, ShutdownCoordinator},
    supervisor::IndexerSupervisor,
};

/// logdeck - realtime log dashboard server
///
/// Accepts persistent WebSocket connections from dashboards, routes typed
/// messages, and supervises the out-of-process log-indexing worker.
#[derive(ClapParser, Debug)]
#[command(name = "logdeck", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Address to bind the HTTP/WebSocket server
    #[arg(long, default_value = "127.0.0.1:8080", env = "LOGDECK_BIND")]
    bind: SocketAddr,

    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Indexer worker executable
    #[arg(long)]
    indexer_command: Option<PathBuf>,

    /// Port the indexer worker listens on
    #[arg(long)]
    indexer_port: Option<u16>,

    /// Index storage directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dashboard server (the default)
    Serve,

    /// Connect to a server and print incoming messages
    Watch {
        /// WebSocket URL (defaults to ws://<bind>/ws)
        url: Option<String>,
    },

    /// Print a running server's status
    Status,
}

/// Fault sources that are recoverable by contract: their failures are
/// logged and survived, never escalated into shutdown.
const SOFT_FAULT_SOURCES: &[&str] = &["indexer-rpc", "client-bridge"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let code = match cli.command {
        Some(Commands::Watch { ref url }) => {
            let url = url
                .clone()
                .unwrap_or_else(|| format!("ws://{}/ws", cli.bind));
            run_watch(url).await
        }
        Some(Commands::Status) => run_status(cli.bind).await,
        Some(Commands::Serve) | None => run_serve(cli).await,
    };
    std::process::exit(code);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "logdeck=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_serve(cli: Cli) -> i32 {
    tracing::info!("logdeck server starting");

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let file = match config_path {
        Some(path) => match config::FileConfig::load(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(error = %e, "failed to load config");
                eprintln!("logdeck: {e}");
                return 1;
            }
        },
        None => None,
    };
    let settings = config::Settings::resolve(
        cli.bind,
        cli.indexer_command,
        cli.indexer_port,
        cli.data_dir,
        file,
    );

    let registry = ConnectionRegistry::new();
    let router = MessageRouter::new();
    let supervisor = IndexerSupervisor::new(settings.worker.clone());
    let shutdown = ShutdownCoordinator::new();
    server::register_builtin_handlers(&router, &supervisor);

    // A worker that fails to come up is not fatal: the server runs with
    // the worker-backed features in degraded mode.
    if let Err(e) = supervisor.start().await {
        tracing::warn!(error = %e, "log indexer unavailable, continuing degraded");
    }

    let listener = match tokio::net::TcpListener::bind(settings.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %settings.bind, error = %e, "failed to bind listening socket");
            eprintln!("logdeck: failed to bind {}: {e}", settings.bind);
            return 1;
        }
    };
    tracing::info!(addr = %settings.bind, "HTTP/WS server listening");

    let started_at = Instant::now();
    let state = server::AppState {
        registry: registry.clone(),
        router,
        supervisor: supervisor.clone(),
        shutdown: shutdown.clone(),
        started_at,
    };

    let (listener_shutdown_tx, listener_shutdown_rx) = oneshot::channel();
    let mut serve_handle = tokio::spawn(server::serve(listener, state, listener_shutdown_rx));

    // Fault channel: uncaught task panics route into shutdown(reason),
    // except those attributed to the soft dependencies.
    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel::<String>();

    let metrics_handle = server::spawn_metrics_task(
        registry.clone(),
        shutdown.clone(),
        started_at,
        settings.metrics_interval,
    );
    supervise_task("metrics", fault_tx.clone(), metrics_handle);

    let orchestrator = Arc::new(Orchestrator::new(
        shutdown.clone(),
        registry,
        supervisor,
        listener_shutdown_tx,
        settings.watchdog,
    ));

    tracing::info!("logdeck server ready");

    enum Trigger {
        External(String),
        ServerExit(String),
    }

    let trigger = tokio::select! {
        _ = terminate_signal() => Trigger::External("terminate signal".into()),
        _ = tokio::signal::ctrl_c() => Trigger::External("interrupt signal".into()),
        Some(fault) = fault_rx.recv() => Trigger::External(fault),
        result = &mut serve_handle => Trigger::ServerExit(match result {
            Ok(Ok(())) => "server stopped".into(),
            Ok(Err(e)) => format!("server error: {e}"),
            Err(e) => format!("server task failed: {e}"),
        }),
    };

    let (reason, server_done) = match trigger {
        Trigger::External(reason) => (reason, false),
        Trigger::ServerExit(reason) => (reason, true),
    };

    let code = orchestrator.shutdown(&reason).await;

    if !server_done {
        // The listener socket is closed; give the HTTP task a moment to wind down.
        let _ = tokio::time::timeout(Duration::from_secs(2), serve_handle).await;
    }

    tracing::info!("logdeck server exiting");
    code
}

/// Wait for SIGTERM. Never resolves on non-Unix platforms.
async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await
}

/// Watch a background task and route its panic into the fault channel.
///
/// Faults attributed to a known soft dependency are logged and survived.
fn supervise_task(
    name: &'static str,
    fault_tx: mpsc::UnboundedSender<String>,
    handle: tokio::task::JoinHandle<()>,
) {
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                let message = panic_text(e.into_panic());
                route_fault(&fault_tx, name, message);
            }
        }
    });
}

fn route_fault(fault_tx: &mpsc::UnboundedSender<String>, source: &str, message: String) {
    if SOFT_FAULT_SOURCES
        .iter()
        .any(|soft| source == *soft || message.contains(soft))
    {
        tracing::warn!(source, message, "recoverable fault from soft dependency");
        return;
    }
    let _ = fault_tx.send(format!("fault in {source}: {message}"));
}

fn panic_text(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Client subcommands ─────────────────────────────────────────────

async fn run_watch(url: String) -> i32 {
    tracing::info!(%url, "logdeck watch starting");

    let client = ReconnectingClient::connect(url.clone(), ReconnectPolicy::default());
    let mut events = client.subscribe_events();
    let mut messages = client.subscribe_messages();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.disconnect();
                let _ = tokio::time::timeout(Duration::from_secs(5), client.join()).await;
                return 0;
            }
            event = events.recv() => {
                match event {
                    Ok(ClientEvent::GaveUp) => {
                        eprintln!("logdeck watch: gave up reconnecting to {url}");
                        return 1;
                    }
                    Ok(event) => tracing::info!(?event, "client event"),
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return 0,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
            message = messages.recv() => {
                match message {
                    Ok(text) => println!("{text}"),
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return 0,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "message stream lagged");
                        continue;
                    }
                }
            }
        }
    }
}

async fn run_status(bind: SocketAddr) -> i32 {
    let url = format!("http://{bind}/status");
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
            Ok(body) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&body).unwrap_or_default()
                );
                0
            }
            Err(e) => {
                eprintln!("logdeck status: invalid response: {e}");
                1
            }
        },
        Ok(resp) => {
            eprintln!("logdeck status: server returned {}", resp.status());
            1
        }
        Err(e) => {
            if e.is_connect() {
                eprintln!(
                    "logdeck status: could not connect to {bind} — is the server running?"
                );
            } else {
                eprintln!("logdeck status: {e}");
            }
            1
        }
    }
}
