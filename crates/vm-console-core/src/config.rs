//! Configuration types for vm-console.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Largest upload chunk; its base64 form must fit a tty canonical line.
pub const MAX_CHUNK_SIZE: usize = 3000;

/// Transport configuration loaded from YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Console-attach process settings
    pub console: ConsoleSettings,
    /// Login credentials
    pub credentials: Credentials,
    /// Prompt patterns
    pub prompts: Prompts,
    /// Timeouts
    pub timeouts: Timeouts,
    /// File transfer settings
    pub transfer: TransferSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

impl TransportConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TransportConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.console.command.trim().is_empty() {
            return Err(Error::Config("console.command cannot be empty".to_string()));
        }

        if self.console.rows == 0 || self.console.cols == 0 {
            return Err(Error::Config("console dimensions must be > 0".to_string()));
        }

        self.prompts.compile()?;

        let timeouts = [
            ("login_ms", self.timeouts.login_ms),
            ("command_ms", self.timeouts.command_ms),
            ("transfer_ms", self.timeouts.transfer_ms),
            ("close_ms", self.timeouts.close_ms),
            ("poll_interval_ms", self.timeouts.poll_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Error::Config(format!("timeouts.{name} must be > 0")));
            }
        }

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "transfer.chunk_size must be in 1..={MAX_CHUNK_SIZE}"
            )));
        }

        Ok(())
    }
}

/// Console-attach process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Program that attaches to a VM console
    pub command: String,
    /// Arguments placed before the VM name
    pub args: Vec<String>,
    /// Flag preceding the namespace (omitted when there is no namespace)
    pub namespace_flag: String,
    /// PTY rows
    pub rows: u16,
    /// PTY columns; wide to keep echoed commands on one line
    pub cols: u16,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            command: "virtctl".to_string(),
            args: vec!["console".to_string()],
            namespace_flag: "-n".to_string(),
            rows: 24,
            cols: 1024,
        }
    }
}

impl ConsoleSettings {
    /// PTY size for the console-attach process.
    pub fn size(&self) -> TerminalSize {
        TerminalSize::new(self.rows, self.cols)
    }
}

/// Size of the pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new size.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

/// Login credentials.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Login user
    pub username: String,
    /// Login password
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: String::new(),
        }
    }
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Prompt patterns (regular expressions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Prompts {
    /// Login prompt
    pub login: String,
    /// Password prompt
    pub password: String,
    /// Shell-ready prompt
    pub shell: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            login: "login:".to_string(),
            password: "Password:".to_string(),
            shell: r"(\[[^\]]+\])?[#$] ".to_string(),
        }
    }
}

impl Prompts {
    /// Compile all three patterns.
    pub fn compile(&self) -> Result<CompiledPrompts> {
        Ok(CompiledPrompts {
            login: compile_pattern(&self.login)?,
            password: compile_pattern(&self.password)?,
            shell: compile_pattern(&self.shell)?,
        })
    }
}

/// Prompt patterns ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledPrompts {
    /// Login prompt
    pub login: Regex,
    /// Password prompt
    pub password: Regex,
    /// Shell-ready prompt
    pub shell: Regex,
}

/// Compile a regex, mapping failures to [`Error::InvalidPattern`].
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Per-prompt wait during login
    pub login_ms: u64,
    /// Whole `exec_command` round trip
    pub command_ms: u64,
    /// Whole upload or download
    pub transfer_ms: u64,
    /// Graceful logout before the process is killed
    pub close_ms: u64,
    /// Interval between console availability probes
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            login_ms: 60_000,
            command_ms: 60_000,
            transfer_ms: 300_000,
            close_ms: 10_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl Timeouts {
    /// Per-prompt login timeout.
    pub fn login(&self) -> Duration {
        Duration::from_millis(self.login_ms)
    }

    /// Command timeout.
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    /// Transfer timeout.
    pub fn transfer(&self) -> Duration {
        Duration::from_millis(self.transfer_ms)
    }

    /// Close timeout.
    pub fn close(&self) -> Duration {
        Duration::from_millis(self.close_ms)
    }

    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// File transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Bytes per upload chunk (each chunk is one base64 line)
    pub chunk_size: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self { chunk_size: 512 }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
