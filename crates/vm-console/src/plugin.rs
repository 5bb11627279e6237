//! Execution-plugin boundary.
//!
//! [`RemoteExecution`] is the surface a test framework's connection plugin
//! drives; [`ConsoleConnection`] implements it on top of a
//! [`ConsoleTransport`].

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use vm_console_core::{ConsoleTarget, Error, Result, TransportConfig};
use vm_console_transport::{ConsoleTransport, TransportState};

/// Operations every remote-execution backend offers.
pub trait RemoteExecution {
    /// Establish the connection. Idempotent.
    fn connect(&mut self) -> Result<()>;

    /// Run `cmd` and return `(return_code, stdout, stderr)`.
    ///
    /// `in_data` is data to pipe into the command's stdin.
    fn exec_command(&mut self, cmd: &str, in_data: Option<&[u8]>)
        -> Result<(i32, String, String)>;

    /// Copy a local file to `remote`.
    fn put_file(&mut self, local: &Path, remote: &str) -> Result<()>;

    /// Copy `remote` to a local file.
    fn fetch_file(&mut self, remote: &str, local: &Path) -> Result<()>;

    /// Tear the connection down. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Serial-console backend for [`RemoteExecution`].
///
/// Every operation connects first when needed, so a connection that was
/// dropped after a protocol error is re-established by the next call.
#[derive(Debug)]
pub struct ConsoleConnection {
    transport: ConsoleTransport,
    wait_for_console: Option<Duration>,
}

impl ConsoleConnection {
    /// Create a connection for `target`; nothing is spawned yet.
    pub fn new(target: ConsoleTarget, config: TransportConfig) -> Result<Self> {
        Ok(Self {
            transport: ConsoleTransport::new(target, config)?,
            wait_for_console: None,
        })
    }

    /// Create a connection with configuration read from a YAML file.
    pub fn from_config_file<P: AsRef<Path>>(target: ConsoleTarget, path: P) -> Result<Self> {
        Self::new(target, TransportConfig::from_file(path)?)
    }

    /// Wait up to `timeout` for the console to become attachable when
    /// connecting, instead of failing on the first attempt.
    pub fn wait_for_console(mut self, timeout: Duration) -> Self {
        self.wait_for_console = Some(timeout);
        self
    }

    /// Underlying transport.
    pub fn transport(&self) -> &ConsoleTransport {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut ConsoleTransport {
        &mut self.transport
    }

    /// Whether a logged-in console is open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Lifecycle state of the transport.
    pub fn state(&self) -> TransportState {
        self.transport.state()
    }
}

impl RemoteExecution for ConsoleConnection {
    fn connect(&mut self) -> Result<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        match self.wait_for_console {
            Some(timeout) => self.transport.connect_when_available(timeout),
            None => self.transport.connect(),
        }
    }

    fn exec_command(
        &mut self,
        cmd: &str,
        in_data: Option<&[u8]>,
    ) -> Result<(i32, String, String)> {
        if in_data.is_some() {
            return Err(Error::Unsupported(
                "piping data into commands over a serial console".to_string(),
            ));
        }
        self.connect()?;
        let result = self.transport.exec_command(cmd)?;
        debug!("{} bytes of console output", result.raw.len());
        Ok(result.into_triple())
    }

    fn put_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        if !local.is_file() {
            return Err(Error::LocalFileNotFound(local.to_path_buf()));
        }
        self.connect()?;
        self.transport.put_file(local, remote)
    }

    fn fetch_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        self.connect()?;
        self.transport.fetch_file(remote, local)
    }

    fn close(&mut self) -> Result<()> {
        self.transport.close()
    }
}
