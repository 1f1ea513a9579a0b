//! Bridge settings, read from `~/.config/termbridge/config.toml`.
//!
//! Every section is optional; missing keys take their defaults.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{TerminalSize, MAX_TERMINAL_DIMENSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{default_shell, SpawnOptions};
use crate::terminal::TerminalSettings;
use crate::transport::TransportConfig;

/// A setting that is out of range or points at nothing.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be a socket address such as 127.0.0.1:9000, got {0}")]
    InvalidListenAddr(String),

    #[error("outbound_queue must be between 1 and 65536, got {0}")]
    InvalidOutboundQueue(usize),

    #[error(
        "heartbeat_timeout_secs ({timeout}) must be greater than heartbeat_interval_secs ({interval}) and both non-zero"
    )]
    InvalidHeartbeat { interval: u64, timeout: u64 },

    #[error("max_sessions must be in 1..=1000 (got {0})")]
    InvalidMaxSessions(usize),

    #[error("terminal size must be between 1x1 and {max}x{max}, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16, max: u16 },

    #[error("shell not found: {0}")]
    InvalidShellPath(String),

    #[error("cwd is not a directory: {0}")]
    InvalidWorkingDirectory(String),

    #[error("unknown log level {0:?} (expected trace, debug, info, warn or error)")]
    InvalidLogLevel(String),
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Everything the bridge reads from its config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and connection settings.
    pub server: ServerConfig,

    /// Shell session settings.
    pub session: SessionConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Listener and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: String,

    /// Capacity of each connection's outbound event queue.
    pub outbound_queue: usize,

    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,

    /// Seconds of silence after which a peer is considered gone.
    pub heartbeat_timeout_secs: u64,
}

/// Shell session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to run for new sessions.
    pub default_shell: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Working directory of new shells. Defaults to the home directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Value of `TERM` in the shell's environment.
    pub term: String,

    /// Columns until the client reports its size.
    pub cols: u16,

    /// Rows until the client reports its size.
    pub rows: u16,

    /// Live shells allowed at once, across all connections.
    pub max_sessions: usize,

    /// Start the shell when a client connects rather than on its first write.
    pub eager_spawn: bool,

    /// End sessions without input or output for this many seconds (0 = never).
    pub idle_timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,

    /// Also write logs to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9000".to_string(),
            outbound_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            shell_args: Vec::new(),
            cwd: None,
            term: "xterm-color".to_string(),
            cols: 80,
            rows: 30,
            max_sessions: 64,
            eager_spawn: false,
            idle_timeout_secs: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// `<config dir>/termbridge/config.toml`, or a relative path when there is no config dir.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_default()
        .join("termbridge")
        .join("config.toml")
}

impl SessionConfig {
    /// Geometry of a session before the client reports its own.
    pub fn default_size(&self) -> TerminalSize {
        TerminalSize::new(self.cols, self.rows)
    }

    /// Spawn template for new shells.
    pub fn spawn_options(&self) -> SpawnOptions {
        let mut options = SpawnOptions::new(&self.default_shell)
            .with_args(&self.shell_args)
            .with_size(self.default_size());
        options.term = self.term.clone();

        if let Some(dir) = self.cwd.clone().or_else(dirs::home_dir) {
            options = options.with_cwd(dir);
        }
        options
    }

    /// Idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl Config {
    /// Overlays `TERMBRIDGE_LISTEN`, `TERMBRIDGE_SHELL` and
    /// `TERMBRIDGE_LOG_LEVEL`. Empty variables are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = non_empty_env("TERMBRIDGE_LISTEN") {
            tracing::info!("Overriding listen_addr from environment: {}", addr);
            self.server.listen_addr = addr;
        }

        if let Some(shell) = non_empty_env("TERMBRIDGE_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }

        if let Some(level) = non_empty_env("TERMBRIDGE_LOG_LEVEL") {
            tracing::info!("Overriding log level from environment: {}", level);
            self.logging.level = level;
        }
    }

    /// Checks ranges and that the shell and working directory exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        if !(1..=65536).contains(&self.server.outbound_queue) {
            return Err(ConfigError::InvalidOutboundQueue(self.server.outbound_queue));
        }

        let interval = self.server.heartbeat_interval_secs;
        let timeout = self.server.heartbeat_timeout_secs;
        if interval == 0 || timeout <= interval {
            return Err(ConfigError::InvalidHeartbeat { interval, timeout });
        }

        if !(1..=1000).contains(&self.session.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.default_size().validate().is_err() {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.cols,
                rows: self.session.rows,
                max: MAX_TERMINAL_DIMENSION,
            });
        }

        // Absolute shells must exist, bare names must resolve on PATH
        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        if let Some(ref cwd) = self.session.cwd {
            if !cwd.is_dir() {
                return Err(ConfigError::InvalidWorkingDirectory(
                    cwd.display().to_string(),
                ));
            }
        }

        if !LOG_LEVELS
            .iter()
            .any(|level| level.eq_ignore_ascii_case(&self.logging.level))
        {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen_addr))
    }

    /// Heartbeat settings for the transport.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            heartbeat_interval: Duration::from_secs(self.server.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.server.heartbeat_timeout_secs),
        }
    }

    /// Per-connection terminal defaults.
    pub fn terminal(&self) -> TerminalSettings {
        TerminalSettings {
            default_size: self.session.default_size(),
            eager_spawn: self.session.eager_spawn,
        }
    }

    /// Reads `path`; a missing file means all defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", path.display()));
            }
        };
        Self::from_toml(&text).with_context(|| format!("Cannot load {}", path.display()))
    }

    /// [`Config::load`] from [`default_config_path`].
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| anyhow::anyhow!("Bad TOML: {}", describe_toml_error(&e)))
    }

    /// Writes the config to `path`, creating missing directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Cannot write {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Config written");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Cannot encode config as TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn describe_toml_error(error: &toml::de::Error) -> String {
    match error.span() {
        Some(span) => format!("{} (bytes {}..{})", error.message(), span.start, span.end),
        None => error.message().to_string(),
    }
}
