//! # vm-console-session
//!
//! Interactive console sessions for vm-console.
//!
//! This crate provides:
//! - PTY lifecycle management for the console-attach process
//! - Output buffering with escape-sequence sanitization
//! - Blocking send/expect/readline primitives
//! - The condition-polling primitive used for every logical wait
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on vm-console-core
//! and is used by vm-console-transport.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod pty;
pub mod session;
pub mod wait;

// Re-export commonly used types
pub use buffer::{ExpectMatch, OutputBuffer};
pub use pty::PtyHandle;
pub use session::{control_byte, InteractiveSession};
pub use wait::{Deadline, PollAttempt, PollError, Sample, TimeoutSampler, DEFAULT_INTERVAL};
