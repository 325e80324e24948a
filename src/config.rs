//! Configuration module for the WebSocket echo server.
//!
//! The endpoint and worker count come from three positional arguments.
//! Session tuning and logging can additionally be set from a TOML file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Handshake timeout recommended for the server role.
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Idle timeout recommended for the server role.
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "websocket-server-async")]
#[command(version)]
#[command(about = "A multi-threaded asynchronous WebSocket echo server", long_about = None)]
#[command(override_usage = "websocket-server-async <address> <port> <threads>\n\n\
    Example:\n      websocket-server-async 0.0.0.0 8080 1")]
pub struct CliArgs {
    /// IPv4 or IPv6 address to bind to
    pub address: IpAddr,

    /// TCP port to bind to
    pub port: u16,

    /// Number of worker threads (values below 1 are treated as 1)
    #[arg(allow_negative_numbers = true)]
    pub threads: i64,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session timing configuration
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    /// Seconds allowed for the opening handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Seconds a read or write may stay pending (0 = no limit)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// WebSocket limits; unset values keep the library defaults
#[derive(Debug, Deserialize, Default)]
pub struct WebSocketSection {
    pub max_message_size: Option<usize>,
    pub max_frame_size: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Per-session settings shared by every session spawned from one listener.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_message_size: Option<usize>,
    pub max_frame_size: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            max_message_size: None,
            max_frame_size: None,
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,
    pub threads: NonZeroUsize,
    pub session: SessionConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from process arguments and optional TOML file.
    ///
    /// Exits the process with a usage message when the arguments do not
    /// match `<address> <port> <threads>`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments, reading the TOML file if one is named.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let idle_timeout = match toml_config.session.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Config {
            address: cli.address,
            port: cli.port,
            threads: clamp_threads(cli.threads),
            session: SessionConfig {
                handshake_timeout: Duration::from_secs(toml_config.session.handshake_timeout_secs),
                idle_timeout,
                max_message_size: toml_config.websocket.max_message_size,
                max_frame_size: toml_config.websocket.max_frame_size,
            },
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Endpoint the listener binds to.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Any requested thread count below one runs with a single worker.
fn clamp_threads(requested: i64) -> NonZeroUsize {
    usize::try_from(requested)
        .ok()
        .and_then(NonZeroUsize::new)
        .unwrap_or(NonZeroUsize::MIN)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
