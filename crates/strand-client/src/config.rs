//! Client configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`strand.toml` or `~/.config/strand/strand.toml`)
//! - Environment variables (`STRAND_ENDPOINT`, `STRAND_TRANSPORT`)
//!
//! A loaded [`ClientConfig`] turns into [`SocketOptions`] or a ready
//! [`Socket`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use strand_protocol::{LegacySerializer, Params, Serializer, Version, PROTOCOL_VERSION};
use tracing::debug;

use crate::options::SocketOptions;
use crate::socket::Socket;
use crate::timer::{stepped, DEFAULT_BACKOFF_MAX_MS, DEFAULT_BACKOFF_STEPS_MS};

/// Environment variable overriding the endpoint.
pub const ENV_ENDPOINT: &str = "STRAND_ENDPOINT";

/// Environment variable overriding the transport.
pub const ENV_TRANSPORT: &str = "STRAND_TRANSPORT";

const CONFIG_PATHS: [&str; 2] = ["strand.toml", "~/.config/strand/strand.toml"];

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Socket endpoint, without the transport suffix.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Transport used to reach the endpoint.
    #[serde(default)]
    pub transport: TransportKind,

    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Reconnect and rejoin backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Wire protocol settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Parameters appended to the connection URL.
    #[serde(default)]
    pub params: toml::Table,
}

/// Which transport to connect with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A WebSocket connection.
    #[default]
    Websocket,
    /// HTTP long-polling, for networks that block WebSockets.
    Longpoll,
}

impl TransportKind {
    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Some(Self::Websocket),
            "longpoll" => Some(Self::Longpoll),
            _ => None,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Push, join and handshake timeout in milliseconds.
    #[serde(default = "default_push_timeout")]
    pub push_ms: u64,

    /// Long-poll request timeout in milliseconds.
    #[serde(default = "default_longpoll_timeout")]
    pub longpoll_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay per attempt in milliseconds.
    #[serde(default = "default_backoff_steps")]
    pub steps_ms: Vec<u64>,

    /// Delay once the steps run out.
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,
}

/// Protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Serializer version advertised as `vsn`: `2.0.0` or `1.0.0`.
    #[serde(default = "default_vsn")]
    pub vsn: String,

    /// Value at which message references wrap back to zero.
    #[serde(default)]
    pub ref_limit: Option<u64>,
}

// Default value functions
fn default_endpoint() -> String {
    "ws://localhost:4000/socket".to_string()
}

fn default_push_timeout() -> u64 {
    10_000
}

fn default_longpoll_timeout() -> u64 {
    20_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_backoff_steps() -> Vec<u64> {
    DEFAULT_BACKOFF_STEPS_MS.to_vec()
}

fn default_backoff_max() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

fn default_vsn() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            transport: TransportKind::default(),
            timeouts: TimeoutConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            protocol: ProtocolConfig::default(),
            params: toml::Table::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            push_ms: default_push_timeout(),
            longpoll_ms: default_longpoll_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            steps_ms: default_backoff_steps(),
            max_ms: default_backoff_max(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            vsn: default_vsn(),
            ref_limit: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the first config file found, or defaults,
    /// then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override is invalid.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                config = Self::from_file(expanded.as_ref())?;
                break;
            }
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        debug!(path = %path.display(), "Loaded client config");
        Ok(config)
    }

    /// Override fields from environment variables read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `STRAND_TRANSPORT` names an unknown transport.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Some(name) = lookup(ENV_TRANSPORT) {
            self.transport = TransportKind::parse(&name)
                .with_context(|| format!("Unknown transport in {ENV_TRANSPORT}: {name}"))?;
        }
        Ok(())
    }

    /// Build socket options from this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported protocol version, a transport
    /// that was not compiled in, or an empty backoff schedule.
    pub fn into_options(&self) -> Result<SocketOptions> {
        if self.reconnect.steps_ms.is_empty() {
            bail!("reconnect.steps_ms must list at least one delay");
        }

        let mut options = SocketOptions::default()
            .with_timeout(Duration::from_millis(self.timeouts.push_ms))
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat.interval_ms))
            .with_longpoller_timeout(Duration::from_millis(self.timeouts.longpoll_ms))
            .with_params(self.connect_params()?);

        options.reconnect_after = stepped(
            self.reconnect.steps_ms.iter().copied().map(Duration::from_millis).collect(),
            Duration::from_millis(self.reconnect.max_ms),
        );

        let vsn: Version = self
            .protocol
            .vsn
            .parse()
            .with_context(|| format!("Invalid protocol version: {}", self.protocol.vsn))?;
        options.codec = match vsn.major {
            2 => Arc::new(Serializer),
            1 => Arc::new(LegacySerializer),
            _ => bail!("Unsupported protocol version: {vsn}"),
        };

        if let Some(limit) = self.protocol.ref_limit {
            options = options.with_ref_limit(limit);
        }

        match self.transport {
            TransportKind::Websocket => {}
            #[cfg(feature = "longpoll")]
            TransportKind::Longpoll => options = options.with_longpoll(),
            #[cfg(not(feature = "longpoll"))]
            TransportKind::Longpoll => bail!("Long-poll transport is not enabled in this build"),
        }

        Ok(options)
    }

    /// Create a socket for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or no Tokio runtime is
    /// running.
    pub fn socket(&self) -> Result<Socket> {
        let options = self.into_options()?;
        Socket::new(self.endpoint.clone(), options).context("Failed to create socket")
    }

    fn connect_params(&self) -> Result<Params> {
        match serde_json::to_value(&self.params).context("Invalid connection params")? {
            Value::Object(params) => Ok(params),
            _ => Ok(Params::new()),
        }
    }
}
