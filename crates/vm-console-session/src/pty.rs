//! PTY (Pseudo-Terminal) handling with portable-pty.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, error, info, warn};

use vm_console_core::{Error, Result, TerminalSize};

/// Size of a single read from the PTY master.
const READ_CHUNK: usize = 4096;

/// Handle to a process spawned behind a PTY.
pub struct PtyHandle {
    /// The master PTY end, held open for the life of the child
    _master: Box<dyn MasterPty + Send>,
    /// The child process
    child: Box<dyn Child + Send + Sync>,
    /// PTY writer
    writer: Box<dyn Write + Send>,
    /// PTY reader, handed to the reader thread by [`PtyHandle::stream_output`]
    reader: Option<Box<dyn Read + Send>>,
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("pid", &self.child.process_id())
            .finish_non_exhaustive()
    }
}

impl PtyHandle {
    /// Spawn `command` with `args` behind a new PTY.
    ///
    /// # Example
    /// ```no_run
    /// use vm_console_session::pty::PtyHandle;
    /// use vm_console_core::TerminalSize;
    ///
    /// # fn example() -> vm_console_core::Result<()> {
    /// let pty = PtyHandle::spawn("virtctl", &["console".into(), "fedora".into()], TerminalSize::new(24, 1024))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(command: &str, args: &[String], size: TerminalSize) -> Result<Self> {
        info!(
            "Spawning PTY: command='{}' args={:?}, size={}x{}",
            command, args, size.rows, size.cols
        );

        let spawn_error = |reason: String| Error::SessionSpawn {
            command: format!("{} {}", command, args.join(" ")).trim_end().to_string(),
            reason,
        };

        let pty_system = native_pty_system();
        let pty_size = PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        debug!("Opening PTY with native system");
        let pair = pty_system.openpty(pty_size).map_err(|e| {
            error!("Failed to open PTY: {}", e);
            spawn_error(format!("failed to open PTY: {e}"))
        })?;

        let mut cmd = CommandBuilder::new(command);
        for arg in args {
            cmd.arg(arg);
        }

        debug!("Spawning child process: {}", command);
        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", command, e);
            spawn_error(e.to_string())
        })?;

        let writer = pair.master.take_writer().map_err(|e| {
            error!("Failed to take PTY writer: {}", e);
            Error::PtyError(format!("Failed to take writer: {e}"))
        })?;

        let reader = pair.master.try_clone_reader().map_err(|e| {
            error!("Failed to clone PTY reader: {}", e);
            Error::PtyError(format!("Failed to clone reader: {e}"))
        })?;

        info!(
            "PTY spawned successfully: command='{}', pid={:?}",
            command,
            child.process_id()
        );

        // The slave end is dropped here so the reader sees EOF once the child exits.
        Ok(Self {
            _master: pair.master,
            child,
            writer,
            reader: Some(reader),
        })
    }

    /// Start the reader thread and return the channel it feeds.
    ///
    /// The thread performs blocking reads and forwards every chunk. It ends,
    /// closing the channel, when the PTY reports EOF or an error. Can only be
    /// called once per handle.
    pub fn stream_output(&mut self) -> Result<mpsc::Receiver<Vec<u8>>> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| Error::PtyError("PTY reader already taken".to_string()))?;
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("console-reader".to_string())
            .spawn(move || {
                let mut buffer = vec![0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            debug!("PTY reader reached EOF");
                            break;
                        }
                        Ok(n) => {
                            if tx.send(buffer[..n].to_vec()).is_err() {
                                break; // Receiver dropped
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // Linux reports EIO on the master once the slave side is gone.
                            debug!("PTY reader stopped: {}", e);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| Error::PtyError(format!("Failed to start reader thread: {e}")))?;

        Ok(rx)
    }

    /// Write data to the PTY.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        debug!("Writing {} bytes to PTY", data.len());
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(data.len())
    }

    /// OS process id of the child, if known.
    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Check if the child process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.child.try_wait().ok().flatten().is_none()
    }

    /// Kill the child process and reap it.
    pub fn kill(&mut self) -> Result<()> {
        if !self.is_alive() {
            debug!("PTY child already exited");
            return Ok(());
        }

        info!("Killing PTY process: pid={:?}", self.pid());
        self.child
            .kill()
            .map_err(|e| Error::PtyError(format!("Kill failed: {e}")))?;

        if let Err(e) = self.child.wait() {
            warn!("Failed to reap PTY child: {}", e);
        }
        Ok(())
    }
}
