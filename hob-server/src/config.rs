//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration. File: ~/.config/hobnet/config.toml or /etc/hobnet/config.toml.
/// Env overrides: HOBNET_SERVER_PORT, HOBNET_BEAT_PORT, HOBNET_OBJECTS_DIR, HOBNET_IP.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port for value messages (default 8080).
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// UDP port heartbeats are broadcast to and received on (default 52316).
    #[serde(default = "default_beat_port")]
    pub beat_port: u16,
    #[serde(default = "default_beat_interval_ms")]
    pub beat_interval_ms: u64,
    #[serde(default = "default_beat_jitter_ms")]
    pub beat_jitter_ms: u64,
    /// Period of connection-pool reconciliation.
    #[serde(default = "default_socket_update_interval_ms")]
    pub socket_update_interval_ms: u64,
    /// TTL of heartbeat datagrams.
    #[serde(default = "default_broadcast_ttl")]
    pub broadcast_ttl: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Directory holding one folder per object.
    #[serde(default = "default_objects_dir")]
    pub objects_dir: PathBuf,
    /// Address announced in heartbeats. Detected when absent.
    #[serde(default)]
    pub ip: Option<String>,
    /// Tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_server_port() -> u16 {
    8080
}
fn default_beat_port() -> u16 {
    hob_core::discovery::BEAT_PORT
}
fn default_beat_interval_ms() -> u64 {
    5000
}
fn default_beat_jitter_ms() -> u64 {
    250
}
fn default_socket_update_interval_ms() -> u64 {
    2000
}
fn default_broadcast_ttl() -> u32 {
    2
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_reconnect_delay_ms() -> u64 {
    500
}
fn default_max_reconnect_attempts() -> u32 {
    20
}
fn default_objects_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents/realityobjects")
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: default_server_port(),
            beat_port: default_beat_port(),
            beat_interval_ms: default_beat_interval_ms(),
            beat_jitter_ms: default_beat_jitter_ms(),
            socket_update_interval_ms: default_socket_update_interval_ms(),
            broadcast_ttl: default_broadcast_ttl(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            objects_dir: default_objects_dir(),
            ip: None,
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn beat_interval(&self) -> Duration {
        Duration::from_millis(self.beat_interval_ms)
    }

    pub fn beat_jitter(&self) -> Duration {
        Duration::from_millis(self.beat_jitter_ms)
    }

    pub fn socket_update_interval(&self) -> Duration {
        Duration::from_millis(self.socket_update_interval_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: default, then the first config file present, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match load_file(&config_paths())? {
        Some(c) => c,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

/// Override fields from environment variables; unparsable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("HOBNET_SERVER_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.server_port = p;
    }
    if let Some(p) = var("HOBNET_BEAT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.beat_port = p;
    }
    if let Some(d) = var("HOBNET_OBJECTS_DIR").filter(|s| !s.is_empty()) {
        c.objects_dir = PathBuf::from(d);
    }
    if let Some(ip) = var("HOBNET_IP").filter(|s| !s.is_empty()) {
        c.ip = Some(ip);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/hobnet/config.toml"));
    }
    out.push(PathBuf::from("/etc/hobnet/config.toml"));
    out
}

/// Parse the first existing file in `paths`.
fn load_file(paths: &[PathBuf]) -> Result<Option<Config>, ConfigError> {
    match paths.iter().find(|p| p.exists()) {
        Some(p) => parse_file(p).map(Some),
        None => Ok(None),
    }
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
