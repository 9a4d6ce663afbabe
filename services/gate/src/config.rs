//! Gateway configuration.
//!
//! Loaded from a TOML file; a few logging settings can be overridden from the
//! environment. Durations are whole seconds.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::GateError;
use crate::proxy::SocketTuning;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "conf/gate.toml";

/// Whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    #[serde(default)]
    pub options: Options,

    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyConfig>,
}

/// Global options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Mirror logs to stderr when writing to a log directory.
    pub debug: bool,

    /// Directory for JSON log files; stdout when unset.
    pub log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins.
    pub log_level: String,

    /// Default for the real-IP preamble.
    pub redirect: bool,

    /// Period of the traffic summary log.
    pub stats_interval_secs: u64,

    /// Grace period for draining sessions on shutdown.
    pub stop_timeout_secs: u64,

    pub heartbeat: HeartbeatConfig,

    pub socket: SocketConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            debug: false,
            log_dir: None,
            log_level: "info".to_string(),
            redirect: false,
            stats_interval_secs: 60,
            stop_timeout_secs: 10,
            heartbeat: HeartbeatConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

impl Options {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Line probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 10,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Socket options for client and backend connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    pub no_delay: bool,
    pub keepalive_secs: u64,
    pub read_buffer: usize,
    pub write_buffer: usize,
    pub read_deadline_secs: u64,
    pub write_deadline_secs: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            keepalive_secs: 600,
            read_buffer: 4096,
            write_buffer: 4096,
            read_deadline_secs: 35,
            write_deadline_secs: 5,
        }
    }
}

impl SocketConfig {
    pub fn tuning(&self) -> SocketTuning {
        SocketTuning {
            no_delay: self.no_delay,
            keepalive: Duration::from_secs(self.keepalive_secs),
            read_buffer: self.read_buffer,
            write_buffer: self.write_buffer,
            read_deadline: Duration::from_secs(self.read_deadline_secs),
            write_deadline: Duration::from_secs(self.write_deadline_secs),
        }
    }
}

/// Tunnel engine type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Tcp,
    Websocket,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Tcp => write!(f, "tcp"),
            ProxyKind::Websocket => write!(f, "websocket"),
        }
    }
}

/// One `[[proxy]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub name: String,
    pub kind: ProxyKind,
    pub listen: String,

    /// Overrides `options.redirect`.
    #[serde(default)]
    pub redirect: Option<bool>,

    /// WebSocket only.
    #[serde(default)]
    pub tls: bool,

    /// WebSocket upgrade paths; empty means the default path.
    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default, rename = "cert")]
    pub certs: Vec<CertConfig>,

    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,
}

/// Certificate chain and private key, both PEM.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertConfig {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

/// One backend line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub addr: String,
    pub max_load: i64,
}

impl GateConfig {
    /// Read, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::parse(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.apply_overrides(
            std::env::var("GATE_LOG_LEVEL").ok(),
            std::env::var("GATE_LOG_DIR").ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without validating.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `GATE_LOG_LEVEL` / `GATE_LOG_DIR` values.
    pub fn apply_overrides(&mut self, log_level: Option<String>, log_dir: Option<String>) {
        if let Some(level) = log_level.filter(|l| !l.is_empty()) {
            self.options.log_level = level;
        }
        if let Some(dir) = log_dir.filter(|d| !d.is_empty()) {
            self.options.log_dir = Some(PathBuf::from(dir));
        }
    }

    /// Structural checks. Cross-proxy checks (duplicate names, recursive
    /// lines) happen when the registry is built.
    pub fn validate(&self) -> Result<(), GateError> {
        let heartbeat = &self.options.heartbeat;
        if heartbeat.interval_secs == 0 || heartbeat.timeout_secs == 0 {
            return Err(GateError::InvalidConfig(
                "heartbeat interval and timeout must be positive".to_string(),
            ));
        }
        if self.options.stats_interval_secs == 0 {
            return Err(GateError::InvalidConfig(
                "stats_interval_secs must be positive".to_string(),
            ));
        }

        let socket = &self.options.socket;
        let zero = [
            ("keepalive_secs", socket.keepalive_secs == 0),
            ("read_deadline_secs", socket.read_deadline_secs == 0),
            ("write_deadline_secs", socket.write_deadline_secs == 0),
            ("read_buffer", socket.read_buffer == 0),
            ("write_buffer", socket.write_buffer == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(GateError::InvalidConfig(format!(
                "socket {field} must be positive"
            )));
        }

        for proxy in &self.proxies {
            let invalid = |msg: &str| GateError::InvalidConfig(format!("proxy {}: {msg}", proxy.name));

            if proxy.name.trim().is_empty() {
                return Err(GateError::InvalidConfig("proxy name is empty".to_string()));
            }
            if proxy.listen.trim().is_empty() {
                return Err(invalid("listen address is empty"));
            }
            if proxy.kind == ProxyKind::Tcp
                && (proxy.tls || !proxy.paths.is_empty() || !proxy.certs.is_empty())
            {
                return Err(invalid("tls, paths and cert apply to websocket proxies only"));
            }
            if let Some(path) = proxy.paths.iter().find(|p| !p.starts_with('/')) {
                return Err(invalid(&format!("path {path:?} must start with '/'")));
            }
            if let Some(node) = proxy.nodes.iter().find(|n| n.max_load <= 0) {
                return Err(invalid(&format!("node {} max_load must be positive", node.addr)));
            }
        }

        Ok(())
    }
}
