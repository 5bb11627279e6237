//! Interactive console session: send/expect over one spawned process.

use regex::Regex;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use tracing::{debug, info, info_span, trace, warn, Span};

use vm_console_core::{excerpt, ConsoleSettings, ConsoleTarget, Error, Result, TerminalSize};

use crate::buffer::{ExpectMatch, OutputBuffer};
use crate::pty::PtyHandle;
use crate::wait::Deadline;

/// Outcome of waiting for more output.
enum Pump {
    Data,
    TimedOut,
    Closed,
}

/// One spawned console-attach process and its accumulated output.
///
/// All I/O takes `&mut self`: a session serves exactly one caller at a time
/// and carries no internal locking. Dropping the session kills the process.
#[derive(Debug)]
pub struct InteractiveSession {
    /// Console target, when spawned for a VM
    target: Option<ConsoleTarget>,
    /// Command line, for diagnostics
    command: String,
    /// PTY handle (None once closed)
    pty: Option<PtyHandle>,
    /// Chunks forwarded by the reader thread
    rx: Receiver<Vec<u8>>,
    /// Raw and sanitized output
    buffer: OutputBuffer,
    /// Reader thread hung up
    eof: bool,
    /// Span every operation runs in
    span: Span,
}

impl InteractiveSession {
    /// Attach to the console of `target`.
    pub fn spawn(target: &ConsoleTarget, settings: &ConsoleSettings) -> Result<Self> {
        let span = info_span!("console", vm = target.name(), namespace = target.namespace());
        Self::spawn_in_span(target, settings, span)
    }

    /// Attach to the console of `target`, logging inside `span`.
    pub fn spawn_in_span(
        target: &ConsoleTarget,
        settings: &ConsoleSettings,
        span: Span,
    ) -> Result<Self> {
        let (command, args) = target.command_line(settings);
        let mut session = Self::spawn_command_in_span(&command, &args, settings.size(), span)?;
        session.target = Some(target.clone());
        Ok(session)
    }

    /// Spawn an arbitrary interactive command.
    pub fn spawn_command(command: &str, args: &[String], size: TerminalSize) -> Result<Self> {
        let span = info_span!("console", command = command);
        Self::spawn_command_in_span(command, args, size, span)
    }

    /// Spawn an arbitrary interactive command, logging inside `span`.
    pub fn spawn_command_in_span(
        command: &str,
        args: &[String],
        size: TerminalSize,
        span: Span,
    ) -> Result<Self> {
        let _enter = span.enter();
        let mut pty = PtyHandle::spawn(command, args, size)?;
        let rx = pty.stream_output()?;
        info!("Session started: pid={:?}", pty.pid());
        drop(_enter);

        Ok(Self {
            target: None,
            command: format!("{} {}", command, args.join(" ")).trim_end().to_string(),
            pty: Some(pty),
            rx,
            buffer: OutputBuffer::new(),
            eof: false,
            span,
        })
    }

    /// Console target, if the session was spawned for one.
    pub fn target(&self) -> Option<&ConsoleTarget> {
        self.target.as_ref()
    }

    /// Command line of the spawned process.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Span the session logs in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// OS process id of the console-attach process.
    pub fn pid(&self) -> Option<u32> {
        self.pty.as_ref().and_then(PtyHandle::pid)
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.pty.is_none()
    }

    /// Whether the spawned process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.pty.as_mut().map(PtyHandle::is_alive).unwrap_or(false)
    }

    /// Whether the process has closed its output stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Write `text` as-is.
    pub fn send(&mut self, text: &str) -> Result<()> {
        self.write(text.as_bytes())
    }

    /// Write `text` followed by a newline.
    pub fn sendline(&mut self, text: &str) -> Result<()> {
        self.write(format!("{text}\n").as_bytes())
    }

    /// Like [`InteractiveSession::sendline`], but never logs the text.
    pub fn sendline_secret(&mut self, text: &str) -> Result<()> {
        let _enter = self.span.enter();
        let pty = self.pty.as_mut().ok_or(Error::SessionClosed)?;
        trace!("send <redacted>");
        pty.write(format!("{text}\n").as_bytes())?;
        Ok(())
    }

    /// Send a control character, e.g. `'d'` for EOF (Ctrl-D).
    pub fn send_control(&mut self, c: char) -> Result<()> {
        let byte = control_byte(c).ok_or_else(|| {
            Error::Other(format!("'{c}' has no control-character equivalent"))
        })?;
        self.write(&[byte])
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let _enter = self.span.enter();
        let pty = self.pty.as_mut().ok_or(Error::SessionClosed)?;
        trace!("send {:?}", String::from_utf8_lossy(data));
        pty.write(data)?;
        Ok(())
    }

    /// Block until the output matches `pattern`.
    ///
    /// Everything up to the end of the match is consumed.
    pub fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<ExpectMatch> {
        let deadline = Deadline::after(timeout);
        self.expect_until(pattern, &deadline)
    }

    /// [`InteractiveSession::expect`] bounded by a shared deadline.
    pub fn expect_until(&mut self, pattern: &Regex, deadline: &Deadline) -> Result<ExpectMatch> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let span = self.span.clone();
        let _enter = span.enter();
        debug!("expect {:?}", pattern.as_str());

        loop {
            if let Some(found) = self.buffer.take_match(pattern) {
                debug!("matched {:?}", found.matched);
                return Ok(found);
            }
            match self.pump(deadline) {
                Pump::Data => continue,
                Pump::TimedOut => return Err(self.timeout_error(pattern.as_str(), deadline)),
                Pump::Closed => return Err(self.eof_error()),
            }
        }
    }

    /// Block until a complete line is available and return it without `\n`.
    pub fn readline(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Deadline::after(timeout);
        self.readline_until(&deadline)
    }

    /// [`InteractiveSession::readline`] bounded by a shared deadline.
    pub fn readline_until(&mut self, deadline: &Deadline) -> Result<String> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let span = self.span.clone();
        let _enter = span.enter();

        loop {
            if let Some(line) = self.buffer.take_line() {
                trace!("line {:?}", line);
                return Ok(line);
            }
            match self.pump(deadline) {
                Pump::Data => continue,
                Pump::TimedOut => return Err(self.timeout_error("end of line", deadline)),
                Pump::Closed => return Err(self.eof_error()),
            }
        }
    }

    /// Keep reading output for `duration` without consuming any of it.
    ///
    /// Fails with [`Error::Eof`] as soon as the process closes its output.
    pub fn watch(&mut self, duration: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let span = self.span.clone();
        let _enter = span.enter();
        let deadline = Deadline::after(duration);

        loop {
            match self.pump(&deadline) {
                Pump::Data => continue,
                Pump::TimedOut => return Ok(()),
                Pump::Closed => return Err(self.eof_error()),
            }
        }
    }

    /// Raw bytes received since the previous call.
    pub fn take_raw(&mut self) -> Vec<u8> {
        self.buffer.take_raw()
    }

    /// Unconsumed sanitized output.
    pub fn pending(&self) -> &str {
        self.buffer.pending()
    }


    /// Terminate the process and release the PTY. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut pty) = self.pty.take() else {
            return Ok(());
        };
        let _enter = self.span.enter();
        info!("Closing session: pid={:?}", pty.pid());
        pty.kill()
    }

    fn pump(&mut self, deadline: &Deadline) -> Pump {
        if self.eof {
            return Pump::Closed;
        }
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Pump::TimedOut;
        }

        match self.rx.recv_timeout(remaining) {
            Ok(chunk) => {
                self.buffer.append(&chunk);
                // Take whatever else already arrived in one go.
                while let Ok(more) = self.rx.try_recv() {
                    self.buffer.append(&more);
                }
                Pump::Data
            }
            Err(RecvTimeoutError::Timeout) => Pump::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Console stream closed: {}", self.command);
                self.eof = true;
                Pump::Closed
            }
        }
    }

    fn timeout_error(&self, pattern: &str, deadline: &Deadline) -> Error {
        warn!(
            "Timed out after {:?} waiting for {:?}",
            deadline.elapsed(),
            pattern
        );
        Error::SessionTimeout {
            pattern: pattern.to_string(),
            timeout_ms: deadline.timeout().as_millis() as u64,
            buffer: excerpt(self.buffer.pending()),
        }
    }

    fn eof_error(&self) -> Error {
        Error::Eof {
            buffer: excerpt(self.buffer.pending()),
        }
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close session on drop: {}", e);
        }
    }
}

/// Map `'a'..='z'` (either case) and `@[\]^_` to their control bytes.
pub fn control_byte(c: char) -> Option<u8> {
    match c.to_ascii_uppercase() {
        c @ ('@'..='_') => Some(c as u8 & 0x1f),
        '?' => Some(0x7f),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> InteractiveSession {
        InteractiveSession::spawn_command(
            "/bin/sh",
            &["-c".to_string(), script.to_string()],
            TerminalSize::new(24, 200),
        )
        .unwrap()
    }

    fn wait_ready(session: &mut InteractiveSession) {
        let ready = Regex::new("ready\n").unwrap();
        session.expect(&ready, Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_control_byte() {
        assert_eq!(control_byte('d'), Some(0x04));
        assert_eq!(control_byte('D'), Some(0x04));
        assert_eq!(control_byte('c'), Some(0x03));
        assert_eq!(control_byte('['), Some(0x1b));
        assert_eq!(control_byte('1'), None);
    }

    #[test]
    fn test_spawn_failure() {
        let result = InteractiveSession::spawn_command(
            "/nonexistent/virtctl",
            &[],
            TerminalSize::new(24, 80),
        );
        assert!(matches!(result, Err(Error::SessionSpawn { .. })));
    }

    #[test]
    fn test_spawn_for_target_records_command_line() {
        let settings = ConsoleSettings {
            command: "/bin/echo".to_string(),
            args: vec!["attach".to_string()],
            ..Default::default()
        };
        let target = ConsoleTarget::new("vm-a").in_namespace("ns-1");
        let mut session = InteractiveSession::spawn(&target, &settings).unwrap();

        assert_eq!(session.command(), "/bin/echo attach vm-a -n ns-1");
        assert_eq!(session.target(), Some(&target));
        let line = session.readline(Duration::from_secs(5)).unwrap();
        assert_eq!(line, "attach vm-a -n ns-1");
    }

    #[test]
    fn test_expect_matches_prompt() {
        let mut session = sh("printf 'Welcome\\nfedora login: '; sleep 5");
        let pattern = Regex::new("login:").unwrap();

        let found = session.expect(&pattern, Duration::from_secs(5)).unwrap();
        assert_eq!(found.matched, "login:");
        assert!(found.before.contains("Welcome"));
    }

    #[test]
    fn test_expect_timeout_carries_buffer() {
        let mut session = sh("printf 'booting...'; sleep 5");
        let pattern = Regex::new("login:").unwrap();
        let start = std::time::Instant::now();

        match session.expect(&pattern, Duration::from_millis(300)) {
            Err(Error::SessionTimeout {
                pattern,
                timeout_ms,
                buffer,
            }) => {
                assert_eq!(pattern, "login:");
                assert_eq!(timeout_ms, 300);
                assert!(buffer.contains("booting"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_expect_reports_eof() {
        let mut session = sh("printf 'bye'");
        let pattern = Regex::new("never").unwrap();
        match session.expect(&pattern, Duration::from_secs(5)) {
            Err(Error::Eof { buffer }) => assert!(buffer.contains("bye")),
            other => panic!("expected EOF, got {other:?}"),
        }
        assert!(session.is_eof());
    }

    #[test]
    fn test_sendline_and_readline() {
        let mut session =
            sh("stty -echo; echo ready; while IFS= read -r l; do echo \"got:$l\"; done");
        wait_ready(&mut session);
        session.sendline("ping").unwrap();

        let line = session.readline(Duration::from_secs(5)).unwrap();
        assert_eq!(line, "got:ping");
    }

    #[test]
    fn test_send_control_eof_ends_cat() {
        let mut session = sh("stty -echo; echo ready; cat; echo done");
        wait_ready(&mut session);
        session.sendline("payload").unwrap();
        session.send_control('d').unwrap();

        let mut lines = Vec::new();
        while let Ok(line) = session.readline(Duration::from_secs(5)) {
            lines.push(line);
            if lines.last().map(String::as_str) == Some("done") {
                break;
            }
        }
        assert_eq!(lines, vec!["payload", "done"]);
    }

    #[test]
    fn test_watch_keeps_output_pending() {
        let mut session = sh("printf 'one\\ntwo'; sleep 5");
        session.watch(Duration::from_millis(300)).unwrap();
        assert_eq!(session.pending(), "one\ntwo");
        assert!(session.is_alive());
    }

    #[test]
    fn test_watch_reports_exit() {
        let mut session = sh("printf 'gone'");
        match session.watch(Duration::from_secs(5)) {
            Err(Error::Eof { buffer }) => assert!(buffer.contains("gone")),
            other => panic!("expected EOF, got {other:?}"),
        }
    }

    #[test]
    fn test_take_raw_keeps_escapes() {
        let mut session = sh("printf '\\033[1mbold\\033[0m\\n'; sleep 5");
        let line = session.readline(Duration::from_secs(5)).unwrap();
        assert_eq!(line, "bold");
        let raw = session.take_raw();
        assert!(raw.starts_with(b"\x1b[1mbold"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session = sh("sleep 30");
        assert!(session.is_alive());
        session.close().unwrap();
        session.close().unwrap();
        assert!(session.is_closed());
        assert!(!session.is_alive());
        assert!(matches!(session.send("x"), Err(Error::SessionClosed)));
        assert!(matches!(
            session.readline(Duration::from_millis(10)),
            Err(Error::SessionClosed)
        ));
    }
}
