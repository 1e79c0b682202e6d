//! Agent configuration: `node.toml` parsed with serde, with log settings
//! overridable from the CLI/environment. Trigger definitions are typed per
//! kind so an unknown trigger type or missing stream settings fail at load
//! time, before anything is armed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 9;
const DEFAULT_READY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_BATCH_SIZE: usize = 10;
const DEFAULT_STREAM_ACK_WAIT_SECS: u64 = 30;
const DEFAULT_STREAM_MAX_DELIVER: i64 = 3;
const DEFAULT_STREAM_FETCH_WAIT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration (`node.toml`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub system: SystemConfig,
    pub heartbeat: HeartbeatConfig,
    pub log: LogConfig,
    /// Sidecar handler bridge; required by `noded serve`, absent when the
    /// agent is embedded with an in-process handler.
    pub handler: Option<HandlerConfig>,
    pub triggers: Vec<TriggerConfig>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ─── [system] ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Agent name, used in logs only.
    pub name: String,
    /// Deployed artifact version reported on every heartbeat. A heartbeat
    /// response carrying a different `package_version` terminates the agent
    /// so the platform restarts it on the expected build.
    pub version: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "noded".to_string(),
            version: String::new(),
        }
    }
}

// ─── [heartbeat] ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Authority address. May be left empty and learned from a probe.
    pub authority_host: String,
    pub authority_port: u16,
    /// Seconds between heartbeat rounds. Default: 9.
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            authority_host: String::new(),
            authority_port: 0,
            interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

// ─── [log] ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter when `RUST_LOG` is unset. Default: "info".
    pub level: String,
    /// "pretty" or "json". Default: "pretty".
    pub format: String,
    /// Optional path for an additional daily-rolling log file.
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

// ─── [handler] ───────────────────────────────────────────────────────────────

/// HTTP bridge to an out-of-process handler sidecar.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandlerConfig {
    /// Base URL of the sidecar, e.g. `http://127.0.0.1:9009`.
    pub base_url: String,
    /// Handler name used in logs and dispatch metadata. Default: "remote".
    #[serde(default = "default_handler_name")]
    pub name: String,
    /// Seconds to wait for the sidecar's `/health` to come up. Default: 30.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

fn default_handler_name() -> String {
    "remote".to_string()
}

fn default_ready_timeout() -> u64 {
    DEFAULT_READY_TIMEOUT_SECS
}

// ─── [[triggers]] ────────────────────────────────────────────────────────────

/// One trigger definition. The `type` tag selects the settings shape, so a
/// typo'd type or missing required setting is a parse error.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerConfig {
    Timer {
        name: String,
        settings: TimerSettings,
    },
    Stream {
        name: String,
        settings: StreamSettings,
    },
}

impl TriggerConfig {
    pub fn name(&self) -> &str {
        match self {
            TriggerConfig::Timer { name, .. } | TriggerConfig::Stream { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TriggerConfig::Timer { .. } => "timer",
            TriggerConfig::Stream { .. } => "stream",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimerSettings {
    /// Cron expression: `sec min hour day month weekday [year]`.
    pub cron: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamSettings {
    /// Transport URL, e.g. `nats://127.0.0.1:4222`.
    pub url: String,
    /// Stream to consume from.
    pub stream: String,
    /// Subject filter within the stream.
    pub subject: String,
    /// Durable consumer name; defaults to the trigger name when empty.
    #[serde(default)]
    pub durable: String,
    /// Messages fetched per batch. Default: 10.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds the stream waits for an ack before redelivering. Default: 30.
    #[serde(default = "default_ack_wait")]
    pub ack_wait_secs: u64,
    /// Delivery attempts before the stream gives up on a message. Default: 3.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
    /// Upper bound on how long one fetch blocks waiting for messages.
    /// Default: 5.
    #[serde(default = "default_fetch_wait")]
    pub fetch_max_wait_secs: u64,
}

fn default_batch_size() -> usize {
    DEFAULT_STREAM_BATCH_SIZE
}

fn default_ack_wait() -> u64 {
    DEFAULT_STREAM_ACK_WAIT_SECS
}

fn default_max_deliver() -> i64 {
    DEFAULT_STREAM_MAX_DELIVER
}

fn default_fetch_wait() -> u64 {
    DEFAULT_STREAM_FETCH_WAIT_SECS
}
