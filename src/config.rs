//! # Configuration Management
//!
//! Centralized configuration for hosting and joining sessions.
//!
//! This module provides structured configuration for the session layer, the
//! transport (framing, compression, fault injection), connect attempts and
//! logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()`
//! - `key=value` settings via `apply_setting()` (CLI flags)
//! - Direct instantiation with defaults
//!
//! Settings are read once when a session starts; changing a config after the
//! session is created has no effect on it.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Session protocol version, reported when a session starts
pub const PROTOCOL_VERSION: u8 = 1;

/// Default listen port for hosts
pub const DEFAULT_LISTEN_PORT: u16 = 27015;

/// Payloads longer than this are candidates for block compression
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 128;

/// Largest message the codec will produce or decompress (4 MiB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Messages pulled from the transport per pump call
pub const DEFAULT_RECEIVE_BATCH: usize = 32;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Session-level configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Connect-attempt configuration
    #[serde(default)]
    pub connect: ConnectConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("SESSION_WIRE_LISTEN_PORT") {
            config.apply_setting("listen_port", &port)?;
        }

        if let Ok(players) = std::env::var("SESSION_WIRE_MAX_PLAYERS") {
            config.apply_setting("max_players", &players)?;
        }

        if let Ok(loss) = std::env::var("SESSION_WIRE_PACKET_LOSS") {
            config.apply_setting("packet_loss", &loss)?;
        }

        if let Ok(latency) = std::env::var("SESSION_WIRE_LATENCY_MS") {
            config.apply_setting("latency", &latency)?;
        }

        if let Ok(debug) = std::env::var("SESSION_WIRE_DEBUG") {
            config.apply_setting("debug", &debug)?;
        }

        Ok(config)
    }

    /// Apply a single `key=value` setting, as handed over by a command line.
    ///
    /// Recognised keys: `debug`, `packet_loss`, `latency`, `send_buffer`,
    /// `recv_buffer`, `listen_port`, `max_players`.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<()> {
        let bad = |what: &str| {
            ProtocolError::ConfigError(format!("Invalid value '{value}' for {what}"))
        };

        match key {
            "debug" => {
                self.logging.debug_logging = match value {
                    "1" | "true" | "on" | "yes" => true,
                    "0" | "false" | "off" | "no" => false,
                    _ => return Err(bad(key)),
                };
            }
            "packet_loss" => {
                self.transport.fake_packet_loss_percent =
                    value.parse::<f32>().map_err(|_| bad(key))?;
            }
            "latency" => {
                self.transport.fake_latency_ms = value.parse::<u32>().map_err(|_| bad(key))?;
            }
            "send_buffer" => {
                self.transport.send_buffer_size = value.parse::<usize>().map_err(|_| bad(key))?;
            }
            "recv_buffer" => {
                self.transport.receive_buffer_size =
                    value.parse::<usize>().map_err(|_| bad(key))?;
            }
            "listen_port" => {
                self.session.listen_port = value.parse::<u16>().map_err(|_| bad(key))?;
            }
            "max_players" => {
                self.session.max_players = value.parse::<usize>().map_err(|_| bad(key))?;
            }
            other => {
                return Err(ProtocolError::ConfigError(format!(
                    "Unknown setting: '{other}'"
                )))
            }
        }
        Ok(())
    }

    /// Apply a list of `key=value` pairs
    pub fn apply_settings<'a, I>(&mut self, settings: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for setting in settings {
            let (key, value) = setting.split_once('=').ok_or_else(|| {
                ProtocolError::ConfigError(format!("Expected key=value, got '{setting}'"))
            })?;
            self.apply_setting(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Every option with its default, as TOML
    pub fn example_config() -> String {
        Self::default()
            .to_toml()
            .unwrap_or_else(|e| format!("# {e}"))
    }

    fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Cannot encode config: {e}")))
    }

    /// Write the configuration as TOML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_toml()?).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot write {}: {e}", path.display()))
        })
    }

    /// Every problem found across all sections. Empty means usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.session.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.connect.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Fail with every problem listed when the configuration is unusable
    pub fn validate_strict(&self) -> Result<()> {
        match self.validate().as_slice() {
            [] => Ok(()),
            errors => Err(ProtocolError::ConfigError(format!(
                "Invalid configuration: {}",
                errors.join("; ")
            ))),
        }
    }
}

/// Session-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Port the host listens on
    pub listen_port: u16,

    /// Maximum number of remote players admitted by a host
    pub max_players: usize,

    /// Interval between host heartbeats carrying authoritative time
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Interval between state-delta updates
    #[serde(with = "duration_serde")]
    pub state_update_interval: Duration,

    /// Interval at which aggregate statistics are recomputed
    #[serde(with = "duration_serde")]
    pub stats_interval: Duration,

    /// Messages pulled from the transport per pump call
    pub receive_batch_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            max_players: 16,
            heartbeat_interval: Duration::from_secs(1),
            state_update_interval: Duration::from_millis(50),
            stats_interval: Duration::from_secs(1),
            receive_batch_size: DEFAULT_RECEIVE_BATCH,
        }
    }
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen_port == 0 {
            errors.push("Listen port cannot be 0".to_string());
        }

        if self.max_players == 0 {
            errors.push("Max players must be greater than 0".to_string());
        } else if self.max_players > 4096 {
            errors.push(format!(
                "Max players very high: {} (maximum: 4096)",
                self.max_players
            ));
        }

        if self.heartbeat_interval.as_millis() < 10 {
            errors.push("Heartbeat interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 60 {
            errors.push("Heartbeat interval too long (maximum: 60s)".to_string());
        }

        if self.state_update_interval.is_zero() {
            errors.push("State update interval cannot be 0".to_string());
        }

        if self.stats_interval.as_millis() < 100 {
            errors.push("Stats interval too short (minimum: 100ms)".to_string());
        }

        if self.receive_batch_size == 0 {
            errors.push("Receive batch size must be greater than 0".to_string());
        } else if self.receive_batch_size > 4096 {
            errors.push(format!(
                "Receive batch size too large: {} (maximum: 4096)",
                self.receive_batch_size
            ));
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Whether to block-compress large payloads
    pub compression_enabled: bool,

    /// Payloads longer than this many bytes are candidates for compression
    pub compression_threshold_bytes: usize,

    /// Maximum size of a single encoded or decompressed message
    pub max_message_size: usize,

    /// Bytes a sender may have queued but not yet delivered; sends beyond
    /// it fail. The local backend counts per connection, the UDP backend
    /// across everything waiting for its socket.
    pub send_buffer_size: usize,

    /// Bytes a UDP connection holds until `receive` takes them; datagrams
    /// beyond it are dropped. The local backend bounds its inboxes with
    /// `send_buffer_size` instead.
    pub receive_buffer_size: usize,

    /// Artificial loss applied to unreliable sends, 0-100
    #[serde(default)]
    pub fake_packet_loss_percent: f32,

    /// Artificial one-way latency applied to every send
    #[serde(default)]
    pub fake_latency_ms: u32,

    /// Connections with no inbound traffic for this long are dropped.
    /// Zero disables the check.
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            max_message_size: MAX_MESSAGE_SIZE,
            send_buffer_size: 512 * 1024,
            receive_buffer_size: 512 * 1024,
            fake_packet_loss_percent: 0.0,
            fake_latency_ms: 0,
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size == 0 {
            errors.push("Max message size cannot be 0".to_string());
        } else if self.max_message_size > 64 * 1024 * 1024 {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum: 64 MB)",
                self.max_message_size
            ));
        }

        if self.compression_enabled && self.compression_threshold_bytes > self.max_message_size {
            errors.push("Compression threshold cannot be larger than max message size".to_string());
        }

        if self.send_buffer_size < 1024 {
            errors.push("Send buffer too small (minimum: 1 KB)".to_string());
        }

        if self.receive_buffer_size < 1024 {
            errors.push("Receive buffer too small (minimum: 1 KB)".to_string());
        }

        if !(0.0..=100.0).contains(&self.fake_packet_loss_percent) {
            errors.push(format!(
                "Packet loss must be between 0 and 100 percent, got {}",
                self.fake_packet_loss_percent
            ));
        }

        if self.fake_latency_ms > 10_000 {
            errors.push(format!(
                "Fake latency too high: {}ms (maximum: 10000ms)",
                self.fake_latency_ms
            ));
        }

        if !self.idle_timeout.is_zero() && self.idle_timeout.as_millis() < 100 {
            errors.push("Idle timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Connect-attempt configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectConfig {
    /// Maximum number of connect attempts before giving up
    pub max_attempts: u32,

    /// Delay between failed attempts
    #[serde(with = "duration_serde")]
    pub retry_delay: Duration,

    /// How long to wait for a connection to reach Active per attempt
    #[serde(with = "duration_serde")]
    pub active_timeout: Duration,

    /// How often the connect loop pumps the session while waiting
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            retry_delay: Duration::from_millis(100),
            active_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl ConnectConfig {
    /// Validate connect configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_attempts == 0 {
            errors.push("Max connect attempts must be greater than 0".to_string());
        }

        if self.retry_delay.as_secs() > 60 {
            errors.push("Retry delay too long (maximum: 60s)".to_string());
        }

        if self.active_timeout.as_millis() < 100 {
            errors.push("Active timeout too short (minimum: 100ms)".to_string());
        }

        if self.poll_interval.is_zero() {
            errors.push("Poll interval cannot be 0".to_string());
        } else if self.poll_interval > self.active_timeout {
            errors.push("Poll interval cannot exceed the active timeout".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Debug toggle; forces DEBUG regardless of `log_level`
    #[serde(default)]
    pub debug_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("session-wire"),
            log_level: Level::INFO,
            debug_logging: false,
        }
    }
}

impl LoggingConfig {
    /// Level after applying the debug toggle
    pub fn effective_level(&self) -> Level {
        if self.debug_logging {
            Level::DEBUG
        } else {
            self.log_level
        }
    }

    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Durations are written as whole milliseconds
mod duration_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer)
            .map(Duration::from_millis)
            .map_err(|e| de::Error::custom(format!("expected milliseconds: {e}")))
    }
}

/// Levels are written lowercase and parsed case-insensitively
mod log_level_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse::<Level>()
            .map_err(|_| de::Error::custom(format!("unknown log level '{name}'")))
    }
}
