//! Server configuration: CLI flags layered over an optional TOML file.
//!
//! Precedence is CLI > config file > built-in defaults. The file mostly
//! describes the indexer worker (where to find the binary, what address to
//! hand it, where the index lives); everything has a sane default so a
//! bare `logdeck serve` works.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shutdown::DEFAULT_WATCHDOG;
use crate::supervisor::WorkerConfig;

/// Top-level config file, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerSection>,
    pub indexer: Option<IndexerSection>,
}

/// `[server]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: Option<SocketAddr>,
    pub metrics_interval_secs: Option<u64>,
    pub shutdown_watchdog_secs: Option<u64>,
}

/// `[indexer]` section: the supervised worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexerSection {
    pub command: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub health_attempts: Option<u32>,
    pub health_interval_ms: Option<u64>,
    pub stop_grace_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
}

impl FileConfig {
    /// Load config from a TOML file path. Returns `None` if the file does
    /// not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // The config names the worker executable we spawn; warn if anyone
        // else can rewrite it.
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}

/// Check permissions on the config file and warn if world-writable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_writable(mode) {
        tracing::warn!(
            "config file {} is world-writable (mode {:o}); it controls which \
             worker binary gets spawned — consider restricting permissions to 644",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-writable bit set.
#[cfg(unix)]
pub fn is_world_writable(mode: u32) -> bool {
    mode & 0o002 != 0
}

/// Default index storage directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("logdeck").join("index"))
        .unwrap_or_else(|| PathBuf::from("logdeck-index"))
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("logdeck").join("config.toml"))
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: SocketAddr,
    pub worker: WorkerConfig,
    pub watchdog: Duration,
    pub metrics_interval: Duration,
}

impl Settings {
    /// Merge CLI values over the file config over defaults.
    pub fn resolve(
        bind: SocketAddr,
        indexer_command: Option<PathBuf>,
        indexer_port: Option<u16>,
        data_dir: Option<PathBuf>,
        file: Option<FileConfig>,
    ) -> Self {
        let file = file.unwrap_or_default();
        let server = file.server.unwrap_or_default();
        let indexer = file.indexer.unwrap_or_default();

        let command = indexer_command
            .or(indexer.command)
            .unwrap_or_else(|| PathBuf::from("logdeck-indexer"));
        let host = indexer.host.unwrap_or_else(|| "127.0.0.1".to_string());
        let port = indexer_port.or(indexer.port).unwrap_or(7700);
        let data_dir = data_dir.or(indexer.data_dir).unwrap_or_else(default_data_dir);

        let mut worker = WorkerConfig::new(command, host, port, data_dir);
        if let Some(attempts) = indexer.health_attempts {
            worker.health_attempts = attempts;
        }
        if let Some(ms) = indexer.health_interval_ms {
            worker.health_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = indexer.stop_grace_secs {
            worker.stop_grace = Duration::from_secs(secs);
        }

        Self {
            bind: server.bind.unwrap_or(bind),
            worker,
            watchdog: server
                .shutdown_watchdog_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_WATCHDOG),
            metrics_interval: server
                .metrics_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30)),
        }
    }
}
