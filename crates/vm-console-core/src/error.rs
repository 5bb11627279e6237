//! Error types for vm-console.

use std::path::PathBuf;

use thiserror::Error;

use crate::mark::Mark;

/// Longest buffer excerpt carried inside an error, in bytes.
pub const MAX_BUFFER_EXCERPT: usize = 2048;

/// Login handshake step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    /// Waiting for the login prompt
    LoginPrompt,
    /// Waiting for the password prompt
    PasswordPrompt,
    /// Waiting for the first shell prompt after login
    ShellPrompt,
}

impl std::fmt::Display for AuthStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStage::LoginPrompt => write!(f, "login prompt"),
            AuthStage::PasswordPrompt => write!(f, "password prompt"),
            AuthStage::ShellPrompt => write!(f, "shell prompt"),
        }
    }
}

/// Main error type for console operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Console-attach process could not be started
    #[error("Failed to spawn '{command}': {reason}")]
    SessionSpawn {
        /// Command line that was attempted
        command: String,
        /// Underlying failure
        reason: String,
    },

    /// Login handshake did not complete
    #[error("Authentication failed waiting for {stage}; last output: {buffer:?}")]
    Authentication {
        /// Step that did not complete
        stage: AuthStage,
        /// Tail of the console buffer at the time of failure
        buffer: String,
    },

    /// An expect/readline wait ran out of time
    #[error("Timed out after {timeout_ms}ms waiting for {pattern:?}; buffer: {buffer:?}")]
    SessionTimeout {
        /// Pattern (or "line") that was awaited
        pattern: String,
        /// Timeout that elapsed
        timeout_ms: u64,
        /// Tail of the unmatched buffer
        buffer: String,
    },

    /// Console stream closed while data was still expected
    #[error("Console closed the stream; buffer: {buffer:?}")]
    Eof {
        /// Tail of the unmatched buffer
        buffer: String,
    },

    /// Operation on a session that was already closed
    #[error("Session already closed")]
    SessionClosed,

    /// Operation needs a logged-in console
    #[error("Console is not connected")]
    NotConnected,

    /// A polled condition never became true
    #[error("Timed out after {timeout_ms}ms ({attempts} attempts); last state: {last_state}")]
    TimeoutExpired {
        /// Configured timeout
        timeout_ms: u64,
        /// Number of samples taken
        attempts: u32,
        /// Last observed value or error
        last_state: String,
    },

    /// Upload source does not exist
    #[error("Local file not found: {0}")]
    LocalFileNotFound(PathBuf),

    /// Failure while streaming a file through the console
    #[error("File transfer of {path} failed (mark {mark}): {reason}")]
    FileTransfer {
        /// Remote or local path involved
        path: String,
        /// Mark of the failed operation
        mark: Mark,
        /// What went wrong
        reason: String,
    },

    /// Command output did not end with a return code line
    #[error("Could not parse command output (mark {mark}): {output:?}")]
    OutputParse {
        /// Mark of the failed operation
        mark: Mark,
        /// Output that failed to parse
        output: String,
    },

    /// PTY-related errors
    #[error("PTY error: {0}")]
    PtyError(String),

    /// Prompt or expect pattern is not a valid regex
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// Offending pattern
        pattern: String,
        /// Regex compiler message
        reason: String,
    },

    /// Requested feature cannot be expressed over a console
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with custom message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error means the console can no longer be trusted.
    ///
    /// Callers must reconnect after a fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SessionSpawn { .. }
                | Error::Authentication { .. }
                | Error::SessionTimeout { .. }
                | Error::Eof { .. }
                | Error::SessionClosed
                | Error::FileTransfer { .. }
                | Error::PtyError(_)
        )
    }
}

/// Keep the last [`MAX_BUFFER_EXCERPT`] bytes of a buffer, on a char boundary.
pub fn excerpt(buffer: &str) -> String {
    if buffer.len() <= MAX_BUFFER_EXCERPT {
        return buffer.to_string();
    }
    let mut start = buffer.len() - MAX_BUFFER_EXCERPT;
    while !buffer.is_char_boundary(start) {
        start += 1;
    }
    buffer[start..].to_string()
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
