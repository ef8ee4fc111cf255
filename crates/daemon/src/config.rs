//! Configuration management for the EngineHub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/enginehub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default engine executable, looked up on `PATH` when not absolute.
pub const DEFAULT_ENGINE_PATH: &str = "pikafish";

/// Default board-recognition endpoint the image proxy forwards to.
pub const DEFAULT_RECOGNITION_ENDPOINT: &str = "https://xiangqiai.com/api/board_recognition";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("host must not be empty")]
    EmptyHost,

    #[error("port_attempts must be between 1 and 100, got {0}")]
    InvalidPortAttempts(u16),

    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("stabilization_ms must be at most 60000, got {0}")]
    InvalidStabilization(u64),

    #[error("{field} must be between 1 and {max} ms, got {value}")]
    InvalidTimeout {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("command_timeout_ms ({command}) exceeds max_command_timeout_ms ({max})")]
    CommandTimeoutAboveMax { command: u64, max: u64 },

    #[error("max_line_length must be at least 64 bytes, got {0}")]
    InvalidMaxLineLength(usize),

    #[error("max_upload_bytes must be greater than 0, got {0}")]
    InvalidMaxUpload(usize),

    #[error("recognition endpoint must start with http:// or https://, got {0}")]
    InvalidEndpoint(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for every millisecond timeout in the engine section.
const MAX_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Main configuration structure for the EngineHub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP listener configuration.
    pub server: ServerConfig,

    /// Engine process and session configuration.
    pub engine: EngineConfig,

    /// Image recognition proxy configuration.
    pub recognition: RecognitionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,

    /// First port to try.
    pub port: u16,

    /// How many consecutive ports to try when the address is in use.
    pub port_attempts: u16,
}

/// Engine process and session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable started when a request does not name one.
    pub default_path: String,

    /// Arguments passed to every engine process.
    pub args: Vec<String>,

    /// Working directory for engine processes. Inherited when unset.
    pub working_dir: Option<PathBuf>,

    /// Grace period after spawn during which an exit fails the creation.
    pub stabilization_ms: u64,

    /// Reply timeout used when a command does not specify one.
    pub command_timeout_ms: u64,

    /// Upper bound for caller-supplied reply timeouts.
    pub max_command_timeout_ms: u64,

    /// Upper bound for a single write to the engine's input.
    pub write_timeout_ms: u64,

    /// How long a `quit` is given to take effect before the process is killed.
    pub quit_grace_ms: u64,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Lines longer than this are split into chunks of this many bytes.
    pub max_line_length: usize,

    /// Drop blank output lines instead of delivering them to waiters.
    pub skip_empty_lines: bool,

    /// Number of trailing output lines returned with every command reply.
    pub recent_lines: usize,
}

/// Image recognition proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Upstream endpoint receiving the multipart upload.
    pub endpoint: String,

    /// Value sent as `origin` (and, with a trailing slash, `referer`).
    pub origin: String,

    /// Largest accepted image, in bytes (default: 10MB).
    pub max_upload_bytes: usize,

    /// Upstream request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            port_attempts: 10,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_path: DEFAULT_ENGINE_PATH.to_string(),
            args: Vec::new(),
            working_dir: None,
            stabilization_ms: 2000,
            command_timeout_ms: 1000,
            max_command_timeout_ms: 60_000,
            write_timeout_ms: 1000,
            quit_grace_ms: 1000,
            max_sessions: 16,
            max_line_length: 64 * 1024,
            skip_empty_lines: true,
            recent_lines: 3,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_RECOGNITION_ENDPOINT.to_string(),
            origin: "https://xiangqiai.com".to_string(),
            max_upload_bytes: 10 * 1024 * 1024, // 10MB
            timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Stabilization window as a [`Duration`].
    pub fn stabilization_window(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }

    /// Write timeout as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Quit grace period as a [`Duration`].
    pub fn quit_grace(&self) -> Duration {
        Duration::from_millis(self.quit_grace_ms)
    }

    /// Resolves a caller-supplied reply timeout.
    ///
    /// `None` and zero fall back to `command_timeout_ms`; anything above
    /// `max_command_timeout_ms` is clamped.
    pub fn reply_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = match requested_ms {
            Some(ms) if ms > 0 => ms.min(self.max_command_timeout_ms),
            _ => self.command_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("enginehub")
        .join("config.toml")
}

fn validate_timeout(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_TIMEOUT_MS {
        return Err(ConfigError::InvalidTimeout {
            field,
            value,
            max: MAX_TIMEOUT_MS,
        });
    }
    Ok(())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - ENGINEHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - ENGINEHUB_PORT: Override the listening port
    /// - ENGINEHUB_ENGINE_PATH: Override the default engine executable
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("ENGINEHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(port) = std::env::var("ENGINEHUB_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(e) => {
                    tracing::warn!("Ignoring invalid ENGINEHUB_PORT {:?}: {}", port, e);
                }
            }
        }

        if let Ok(path) = std::env::var("ENGINEHUB_ENGINE_PATH") {
            if !path.is_empty() {
                tracing::info!("Overriding engine path from environment: {}", path);
                self.engine.default_path = path;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    /// The engine path is not checked here; a missing engine surfaces as a
    /// spawn failure on the request that tries to start it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.server.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if self.server.port_attempts < 1 || self.server.port_attempts > 100 {
            return Err(ConfigError::InvalidPortAttempts(self.server.port_attempts));
        }

        let engine = &self.engine;
        if engine.max_sessions < 1 || engine.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(engine.max_sessions));
        }

        if engine.stabilization_ms > 60_000 {
            return Err(ConfigError::InvalidStabilization(engine.stabilization_ms));
        }

        validate_timeout("command_timeout_ms", engine.command_timeout_ms)?;
        validate_timeout("max_command_timeout_ms", engine.max_command_timeout_ms)?;
        validate_timeout("write_timeout_ms", engine.write_timeout_ms)?;
        validate_timeout("quit_grace_ms", engine.quit_grace_ms)?;

        if engine.command_timeout_ms > engine.max_command_timeout_ms {
            return Err(ConfigError::CommandTimeoutAboveMax {
                command: engine.command_timeout_ms,
                max: engine.max_command_timeout_ms,
            });
        }

        if engine.max_line_length < 64 {
            return Err(ConfigError::InvalidMaxLineLength(engine.max_line_length));
        }

        if self.recognition.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidMaxUpload(self.recognition.max_upload_bytes));
        }

        let endpoint = &self.recognition.endpoint;
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
