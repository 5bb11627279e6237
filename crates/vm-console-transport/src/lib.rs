//! # vm-console-transport
//!
//! Remote execution over a logged-in serial console.
//!
//! This crate drives an [`InteractiveSession`](vm_console_session::InteractiveSession)
//! through the login handshake and then frames every operation with a fresh
//! sentinel mark:
//!
//! - Command execution with exit status (`cmd ; echo $? && echo MARK`)
//! - File upload as base64 lines fed to `base64 -d`
//! - File download by decoding the output of `base64`
//!
//! ## Architecture
//!
//! This is Layer 2 in the architecture:
//! - Depends on: vm-console-core, vm-console-session
//! - Used by: vm-console

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod console;
pub mod framing;

pub use console::{ConsoleTransport, TransportState};
