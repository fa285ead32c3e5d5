//! Agent configuration structs and loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;
use super::validation;
use crate::storage::{Overflow, QueueOptions};

/// Full agent configuration (`config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub location: LocationConfig,
    pub queue: QueueConfig,
    pub uplink: UplinkConfig,
}

// ============================================================================
// Sections
// ============================================================================

/// Remote device service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::SERVER_HOST.to_string(),
            port: defaults::SERVER_PORT,
            tls: true,
        }
    }
}

impl ServerConfig {
    pub fn uri(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Receiver acquisition and fusion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Forward only every Nth fused record.
    pub decimate: u32,
    /// Require an orientation message in every fused record.
    pub orientation: bool,
    /// Require a GPS time message (adds `gps_week` to the status).
    pub require_gps_time: bool,
    /// Queue a `fix_mode_changed` event when the fix mode changes.
    pub fix_change_events: bool,
    pub driver: Option<DriverConfig>,
    pub format: SourceFormat,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            decimate: defaults::DECIMATE,
            orientation: false,
            require_gps_time: false,
            fix_change_events: false,
            driver: None,
            format: SourceFormat::default(),
        }
    }
}

/// Where receiver bytes come from. Exactly one per config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverConfig {
    Tcp { host: String, port: u16 },
    /// Serial port, opened 8N1 raw at `baud`.
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    /// Capture file replay.
    File { path: PathBuf },
    Stdin,
}

fn default_baud() -> u32 {
    defaults::SERIAL_BAUD
}

impl std::fmt::Display for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Serial { port, baud } => write!(f, "serial:{port}@{baud}"),
            Self::File { path } => write!(f, "file:{}", path.display()),
            Self::Stdin => write!(f, "stdin"),
        }
    }
}

/// Wire format of the receiver stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceFormat {
    /// SBP binary framing
    #[default]
    Sbp,
    /// One SBP-JSON object per line
    SbpJson,
}

/// Durable queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Data directory for queues and the process lock; platform data dir if unset.
    pub dir: Option<PathBuf>,
    pub state_max_depth: usize,
    pub event_max_depth: usize,
    pub overflow: Overflow,
    pub retain_acked: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: None,
            state_max_depth: defaults::STATE_QUEUE_MAX_DEPTH,
            event_max_depth: defaults::EVENT_QUEUE_MAX_DEPTH,
            overflow: Overflow::default(),
            retain_acked: defaults::RETAIN_ACKED,
        }
    }
}

impl QueueConfig {
    pub fn state_options(&self) -> QueueOptions {
        QueueOptions {
            max_depth: self.state_max_depth,
            overflow: self.overflow,
        }
    }

    pub fn event_options(&self) -> QueueOptions {
        QueueOptions {
            max_depth: self.event_max_depth,
            overflow: self.overflow,
        }
    }
}

/// Uplink session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub state_window: usize,
    pub event_window: usize,
    pub retry_backoff_secs: u64,
    pub batch_wait_ms: u64,
    pub connect_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub backlog_report_secs: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            state_window: defaults::STATE_WINDOW,
            event_window: defaults::EVENT_WINDOW,
            retry_backoff_secs: defaults::RETRY_BACKOFF_SECS,
            batch_wait_ms: defaults::BATCH_WAIT_MS,
            connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECS,
            stop_timeout_secs: defaults::STOP_TIMEOUT_SECS,
            backlog_report_secs: defaults::BACKLOG_REPORT_SECS,
        }
    }
}

impl UplinkConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),
    #[error("config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("no config file found (looked in: {})", display_paths(.0))]
    NotFound(Vec<PathBuf>),
    #[error("config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("no access token: set NAV_UPLINK_ACCESS_TOKEN or provide {}", .0.display())]
    MissingCredentials(PathBuf),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Loading
// ============================================================================

impl AgentConfig {
    /// Locate and load the config file.
    ///
    /// Search order: `explicit` (from `--config`), `$NAV_UPLINK_CONFIG`,
    /// `<config_dir>/nav-uplink/config.toml`. The first candidate that exists
    /// is loaded; an explicit path that does not exist is an error.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        if let Some(path) = explicit {
            let config = Self::load_from_file(path)?;
            return Ok((config, path.to_path_buf()));
        }

        let mut candidates = Vec::new();
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV) {
            candidates.push(PathBuf::from(path));
        }
        if let Some(dir) = super::config_dir() {
            candidates.push(dir.join(defaults::CONFIG_FILE_NAME));
        }

        for path in &candidates {
            if path.exists() {
                let config = Self::load_from_file(path)?;
                info!(path = %path.display(), "Loaded agent config");
                return Ok((config, path.clone()));
            }
        }
        Err(ConfigError::NotFound(candidates))
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate TOML text. Warnings are logged, errors returned.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in validation::validate_unknown_keys(contents) {
            warn!(field = %w.field, "{w}");
        }

        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (errors, warnings) = validation::validate_ranges(self);
        for w in &warnings {
            warn!(field = %w.field, "{w}");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Directory holding queues, the process lock and credentials.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        self.queue.dir.clone().or_else(super::data_dir).ok_or_else(|| {
            ConfigError::Validation(vec![
                "cannot determine a data directory; set queue.dir".to_string()
            ])
        })
    }
}
