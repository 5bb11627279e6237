//! # vm-console
//!
//! Remote command execution and file transfer through the serial console of
//! a virtual machine.
//!
//! Where no network path into a guest exists, the console is the only way
//! in. This crate logs in over it and exposes the usual execution-plugin
//! operations: run a command, upload a file, download a file.
//!
//! ## Architecture
//!
//! This is the top layer that ties together:
//! - vm-console-core: Errors, configuration, targets, marks
//! - vm-console-session: PTY sessions and condition polling
//! - vm-console-transport: Login handshake and sentinel framing
//!
//! ## Example
//! ```no_run
//! use std::path::Path;
//! use vm_console::{ConsoleConnection, ConsoleTarget, RemoteExecution, TransportConfig};
//!
//! # fn example() -> vm_console::Result<()> {
//! let config = TransportConfig::from_file("vm-console.yaml")?;
//! vm_console::logging::init(&config.logging.level);
//!
//! let mut vm = ConsoleConnection::new(ConsoleTarget::new("fedora").in_namespace("tests"), config)?;
//! let (rc, stdout, _) = vm.exec_command("cat /etc/os-release", None)?;
//! println!("exit {rc}: {stdout}");
//! vm.put_file(Path::new("setup.sh"), "/root/setup.sh")?;
//! vm.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod logging;
pub mod plugin;

// Re-export commonly used types
pub use plugin::{ConsoleConnection, RemoteExecution};
pub use vm_console_core::{
    AuthStage, ConsoleTarget, Credentials, Error, ExecutionResult, Mark, Result, TransportConfig,
};
pub use vm_console_session::{Deadline, PollError, Sample, TimeoutSampler};
pub use vm_console_transport::{ConsoleTransport, TransportState};
