//! Configuration resolution for relaybridge.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (`--config PATH`, or the global settings.json)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)
//!
//! The resolved config is immutable for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ndjson::{DEFAULT_METHOD, DEFAULT_TEMPLATE};

/// Event kind used for both inbound and outbound bridge messages.
pub const DEFAULT_EVENT_KIND: u16 = 1573;

/// Complete relaybridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the relay (`ws://` or `wss://`).
    pub url: String,
    /// Event kind for inbound requests and outbound responses.
    pub event_kind: u16,
    /// Hex public key to reply to when a worker response carries no reply address.
    pub default_recipient: Option<String>,
    /// Fixed delay between connection attempts.
    pub reconnect_delay_secs: u64,
    /// Upper bound on one connection attempt, handshake included.
    pub connect_timeout_secs: u64,
    /// How long `publish` waits for the relay's `OK`.
    pub publish_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "wss://dev-relay.dephy.dev".to_string(),
            event_kind: DEFAULT_EVENT_KIND,
            default_recipient: None,
            reconnect_delay_secs: 5,
            connect_timeout_secs: 10,
            publish_timeout_secs: 10,
        }
    }
}

impl RelayConfig {
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

/// Worker subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program to execute.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory; inherits the daemon's when unset.
    pub working_directory: Option<PathBuf>,
    /// Fixed delay before restarting an exited worker.
    pub restart_delay_secs: u64,
    /// Grace period after SIGINT before the worker is killed.
    pub terminate_timeout_secs: u64,
    /// JSON-RPC method of each request.
    pub method: String,
    /// Template name carried in `params.template`.
    pub template: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "node".to_string(),
            args: vec!["server/mcp-server.js".to_string()],
            working_directory: None,
            restart_delay_secs: 5,
            terminate_timeout_secs: 5,
            method: DEFAULT_METHOD.to_string(),
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl WorkerConfig {
    pub const fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse the new item.
    #[default]
    Reject,
    /// Evict the oldest waiting item to make room.
    DropOldest,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reject" => Ok(Self::Reject),
            "drop-oldest" => Ok(Self::DropOldest),
            other => Err(Error::Config(format!("Unknown overflow policy: {other}"))),
        }
    }
}

/// Request queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of waiting items. `None` means unbounded.
    pub capacity: Option<usize>,
    /// Policy applied when `capacity` is reached.
    pub overflow: OverflowPolicy,
    /// Delay before retrying a dispatch the worker could not accept.
    pub dispatch_retry_ms: u64,
    /// Dispatch attempts per item before it is dropped.
    pub max_attempts: u32,
    /// Interval between status log lines.
    pub status_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::default(),
            dispatch_retry_ms: 1000,
            max_attempts: 3,
            status_interval_secs: 60,
        }
    }
}

impl QueueConfig {
    pub const fn dispatch_retry(&self) -> Duration {
        Duration::from_millis(self.dispatch_retry_ms)
    }

    pub const fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

/// Relay identity settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex-encoded 32-byte secret key. Takes precedence over `key_path`.
    pub secret_key: Option<String>,
    /// File holding the raw secret key; generated when missing.
    pub key_path: Option<PathBuf>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(self.relay.url.starts_with("ws://") || self.relay.url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "Relay URL must use ws:// or wss://, got {}",
                self.relay.url
            )));
        }
        if self.relay.connect_timeout_secs == 0 {
            return Err(Error::Config("connect_timeout_secs must be at least 1".into()));
        }
        if self.worker.command.trim().is_empty() {
            return Err(Error::Config("Worker command is empty".into()));
        }
        if self.queue.capacity == Some(0) {
            return Err(Error::Config("Queue capacity must be at least 1".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the global settings file is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("settings.json"))
}

/// Default location of the identity key file.
pub fn default_key_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("identity.key"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".relaybridge"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/relaybridge"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("relaybridge"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("RELAYBRIDGE_EVENT_KIND")
        && let Ok(n) = val.parse()
    {
        config.relay.event_kind = n;
    }
    if let Ok(val) = std::env::var("RELAYBRIDGE_QUEUE_CAPACITY")
        && let Ok(n) = val.parse()
    {
        config.queue.capacity = Some(n);
    }
    if let Ok(val) = std::env::var("RELAYBRIDGE_QUEUE_OVERFLOW")
        && let Ok(policy) = val.parse()
    {
        config.queue.overflow = policy;
    }
    if let Ok(val) = std::env::var("RELAYBRIDGE_MAX_ATTEMPTS")
        && let Ok(n) = val.parse()
    {
        config.queue.max_attempts = n;
    }
    if let Ok(val) = std::env::var("RELAYBRIDGE_WORKER_METHOD") {
        config.worker.method = val;
    }
    if let Ok(val) = std::env::var("RELAYBRIDGE_WORKER_TEMPLATE") {
        config.worker.template = val;
    }
}
