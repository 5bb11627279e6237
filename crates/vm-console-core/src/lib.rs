//! # vm-console-core
//!
//! Core types for vm-console.
//!
//! This crate contains all fundamental types with **no internal dependencies**
//! on other vm-console crates. It provides:
//!
//! - Error types
//! - Transport configuration (YAML)
//! - Console targets (VM name, namespace)
//! - Sentinel marks
//! - Command execution results
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - all other crates depend on this one,
//! but this crate has no dependencies on other vm-console crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod mark;
pub mod result;
pub mod target;

// Re-export commonly used types
pub use config::{
    compile_pattern, CompiledPrompts, ConsoleSettings, Credentials, LoggingSettings, Prompts,
    TerminalSize, Timeouts, TransferSettings, TransportConfig,
};
pub use error::{excerpt, AuthStage, Error, Result};
pub use mark::Mark;
pub use result::ExecutionResult;
pub use target::ConsoleTarget;
