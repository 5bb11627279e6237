//! Remote execution over a logged-in serial console.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, info_span, warn, Span};

use vm_console_core::{
    excerpt, AuthStage, CompiledPrompts, ConsoleTarget, Credentials, Error, ExecutionResult, Mark,
    Result, TransportConfig,
};
use vm_console_session::{Deadline, InteractiveSession, TimeoutSampler};

use crate::framing::{self, ChunkEncoder, LineKind};

/// Where a [`ConsoleTransport`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No console session
    Disconnected,
    /// Console spawned, login handshake running
    Authenticating,
    /// Logged in, at a shell prompt
    Ready,
    /// Running a command
    Executing,
    /// Streaming a file to the guest
    Uploading,
    /// Streaming a file from the guest
    Downloading,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Authenticating => "authenticating",
            TransportState::Ready => "ready",
            TransportState::Executing => "executing",
            TransportState::Uploading => "uploading",
            TransportState::Downloading => "downloading",
        };
        f.write_str(name)
    }
}

/// Runs commands and moves files through the serial console of one VM.
///
/// Operations are strictly sequential and take `&mut self`. A protocol
/// error that leaves the console out of sync (timeout, EOF, failed
/// transfer) tears the session down; the next operation must reconnect.
///
/// # Example
/// ```no_run
/// use vm_console_core::{ConsoleTarget, TransportConfig};
/// use vm_console_transport::ConsoleTransport;
///
/// # fn example() -> vm_console_core::Result<()> {
/// let target = ConsoleTarget::new("fedora").in_namespace("tests");
/// let mut console = ConsoleTransport::new(target, TransportConfig::default())?;
/// console.connect()?;
/// let result = console.exec_command("uname -r")?;
/// println!("{} -> {}", result.return_code, result.stdout);
/// console.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConsoleTransport {
    target: ConsoleTarget,
    config: TransportConfig,
    prompts: CompiledPrompts,
    session: Option<InteractiveSession>,
    state: TransportState,
    span: Span,
}

impl ConsoleTransport {
    /// Create a disconnected transport; validates `config`.
    pub fn new(target: ConsoleTarget, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let prompts = config.prompts.compile()?;
        let span = info_span!(
            "console_transport",
            vm = target.name(),
            namespace = target.namespace()
        );

        Ok(Self {
            target,
            config,
            prompts,
            session: None,
            state: TransportState::Disconnected,
            span,
        })
    }

    /// Log inside `span` instead of the default per-VM span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Target VM.
    pub fn target(&self) -> &ConsoleTarget {
        &self.target
    }

    /// Configuration in use.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Whether the console is logged in and idle.
    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Ready && self.session.is_some()
    }

    /// Attach to the console and log in.
    ///
    /// Does nothing when already connected. A failed login closes the
    /// session and is not retried.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let span = self.span.clone();
        let _enter = span.enter();
        info!("Connecting to console of {}", self.target);

        self.state = TransportState::Authenticating;
        match InteractiveSession::spawn_in_span(&self.target, &self.config.console, span.clone()) {
            Ok(session) => self.login(session),
            Err(e) => {
                self.state = TransportState::Disconnected;
                Err(e)
            }
        }
    }

    /// Like [`ConsoleTransport::connect`], but first wait up to `timeout`
    /// for the console to accept attachment.
    ///
    /// A console-attach process that exits straight away (VM still
    /// starting) is retried every `poll_interval`; a process that cannot be
    /// spawned at all fails immediately.
    pub fn connect_when_available(&mut self, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let span = self.span.clone();
        let _enter = span.enter();
        info!(
            "Waiting up to {:?} for console of {} to become available",
            timeout, self.target
        );

        let interval = self.config.timeouts.poll_interval();
        let session = TimeoutSampler::new(timeout, || self.probe(interval))
            .with_interval(interval)
            .retry_on(|e: &Error| matches!(e, Error::Eof { .. } | Error::Io(_)))
            .wait_for(|_| true)?;

        self.state = TransportState::Authenticating;
        self.login(session)
    }

    /// Spawn a session and check that it is still running after `settle`.
    ///
    /// Output is left pending for the login handshake. The local PTY echoes
    /// the nudge, so getting a line back proves nothing about the process.
    fn probe(&self, settle: Duration) -> Result<InteractiveSession> {
        let mut session =
            InteractiveSession::spawn_in_span(&self.target, &self.config.console, self.span.clone())?;
        session.sendline("")?;
        session.watch(settle)?;
        if session.is_eof() || !session.is_alive() {
            debug!("Console process exited during probe");
            return Err(Error::Eof {
                buffer: excerpt(session.pending()),
            });
        }
        Ok(session)
    }

    fn login(&mut self, mut session: InteractiveSession) -> Result<()> {
        let timeout = self.config.timeouts.login();
        match authenticate(&mut session, &self.config.credentials, &self.prompts, timeout) {
            Ok(()) => {
                info!("Logged in as {}", self.config.credentials.username);
                self.session = Some(session);
                self.state = TransportState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!("Login to {} failed: {}", self.target, e);
                if let Err(close_err) = session.close() {
                    warn!("Failed to close console after login failure: {}", close_err);
                }
                self.state = TransportState::Disconnected;
                Err(e)
            }
        }
    }

    /// Run `cmd` in the guest shell.
    ///
    /// Output is stdout and stderr interleaved as the console shows them;
    /// `stderr` of the result is always empty.
    pub fn exec_command(&mut self, cmd: &str) -> Result<ExecutionResult> {
        let span = self.span.clone();
        let _enter = span.enter();
        let mark = Mark::new();
        let deadline = Deadline::after(self.config.timeouts.command());
        debug!("exec {:?} (mark {})", cmd, mark);

        let result = {
            let (session, prompts) = self.begin(TransportState::Executing)?;
            run_command(session, &prompts.shell, cmd, &mark, &deadline)
        };
        if let Ok(result) = &result {
            info!("Command {:?} returned {}", cmd, result.return_code);
        }
        self.finish(result)
    }

    /// Copy `local` to `remote` in the guest.
    ///
    /// The file is checked for before the console is touched. Any failure
    /// after that is reported as [`Error::FileTransfer`] and leaves a
    /// partial remote file behind.
    pub fn put_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        if !local.is_file() {
            return Err(Error::LocalFileNotFound(local.to_path_buf()));
        }
        self.ensure_ready()?;

        let span = self.span.clone();
        let _enter = span.enter();
        let mark = Mark::new();
        info!("Uploading {} to {} (mark {})", local.display(), remote, mark);

        let source = File::open(local).map_err(|e| transfer_error(remote, &mark, e))?;
        let chunk_size = self.config.transfer.chunk_size;
        let deadline = Deadline::after(self.config.timeouts.transfer());

        let result = {
            let (session, prompts) = self.begin(TransportState::Uploading)?;
            upload(session, &prompts.shell, source, remote, &mark, chunk_size, &deadline)
                .map_err(|e| transfer_error(remote, &mark, e))
        };
        self.finish(result)
    }

    /// Copy `remote` from the guest into `local`, byte for byte.
    pub fn fetch_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        self.ensure_ready()?;

        let span = self.span.clone();
        let _enter = span.enter();
        let mark = Mark::new();
        info!("Downloading {} to {} (mark {})", remote, local.display(), mark);

        let sink = File::create(local)
            .map_err(|e| transfer_error(&local.display().to_string(), &mark, e))?;
        let deadline = Deadline::after(self.config.timeouts.transfer());

        let result = {
            let (session, prompts) = self.begin(TransportState::Downloading)?;
            download(session, &prompts.shell, BufWriter::new(sink), remote, &mark, &deadline)
                .map_err(|e| transfer_error(remote, &mark, e))
        };
        if let Ok(bytes) = &result {
            debug!("Downloaded {} bytes", bytes);
        }
        self.finish(result).map(|_| ())
    }

    /// Log out and terminate the console session.
    ///
    /// Always ends [`TransportState::Disconnected`]; a logout that does not
    /// reach the login prompt within `close_ms` is followed by a kill
    /// anyway.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            self.state = TransportState::Disconnected;
            return Ok(());
        };
        let _enter = self.span.enter();
        info!("Closing console of {}", self.target);

        if self.state == TransportState::Ready {
            if let Err(e) = logout(&mut session, &self.prompts.login, self.config.timeouts.close()) {
                warn!("Logout did not complete, killing console: {}", e);
            }
        }
        self.state = TransportState::Disconnected;
        session.close()
    }

    /// Terminate the console session without logging out.
    pub fn force_close(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _enter = self.span.enter();
            info!("Force closing console of {}", self.target);
            if let Err(e) = session.close() {
                warn!("Failed to kill console session: {}", e);
            }
        }
        self.state = TransportState::Disconnected;
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Enter `next` and hand out the session for one operation.
    fn begin(
        &mut self,
        next: TransportState,
    ) -> Result<(&mut InteractiveSession, &CompiledPrompts)> {
        if self.state != TransportState::Ready {
            return Err(Error::NotConnected);
        }
        let session = self.session.as_mut().ok_or(Error::NotConnected)?;
        // Raw history is per operation.
        session.take_raw();
        self.state = next;
        Ok((session, &self.prompts))
    }

    /// Return to `Ready`, or drop the session when `result` left it unusable.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Err(e) if e.is_fatal() => {
                warn!("Console of {} out of sync, disconnecting: {}", self.target, e);
                self.force_close();
            }
            _ => self.state = TransportState::Ready,
        }
        result
    }
}

impl Drop for ConsoleTransport {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.force_close();
        }
    }
}

fn authenticate(
    session: &mut InteractiveSession,
    credentials: &Credentials,
    prompts: &CompiledPrompts,
    timeout: Duration,
) -> Result<()> {
    // Wake the console; whatever was on screen before is stale.
    session.sendline("")?;
    session.sendline("")?;
    session
        .readline(timeout)
        .map_err(|e| auth_failure(AuthStage::LoginPrompt, e))?;

    session
        .expect(&prompts.login, timeout)
        .map_err(|e| auth_failure(AuthStage::LoginPrompt, e))?;
    session.sendline(&credentials.username)?;

    session
        .expect(&prompts.password, timeout)
        .map_err(|e| auth_failure(AuthStage::PasswordPrompt, e))?;
    session.sendline_secret(&credentials.password)?;

    session
        .expect(&prompts.shell, timeout)
        .map_err(|e| auth_failure(AuthStage::ShellPrompt, e))?;
    Ok(())
}

fn auth_failure(stage: AuthStage, err: Error) -> Error {
    match err {
        Error::SessionTimeout { buffer, .. } | Error::Eof { buffer } => {
            Error::Authentication { stage, buffer }
        }
        other => other,
    }
}

fn logout(session: &mut InteractiveSession, login: &Regex, timeout: Duration) -> Result<()> {
    session.sendline("")?;
    session.send_control('d')?;
    session.expect(login, timeout)?;
    Ok(())
}

fn run_command(
    session: &mut InteractiveSession,
    shell: &Regex,
    cmd: &str,
    mark: &Mark,
    deadline: &Deadline,
) -> Result<ExecutionResult> {
    session.send(&framing::command_line(cmd, mark))?;

    let mut lines = Vec::new();
    loop {
        let line = session.readline_until(deadline)?;
        match framing::classify(mark, &line) {
            LineKind::Terminator => break,
            LineKind::Echo => lines.clear(),
            LineKind::Content => lines.push(line),
        }
    }
    session.expect_until(shell, deadline)?;

    let text = framing::join_lines(&lines);
    let (return_code, stdout) =
        framing::parse_command_output(&text).ok_or_else(|| Error::OutputParse {
            mark: mark.clone(),
            output: excerpt(&text),
        })?;
    Ok(ExecutionResult::new(return_code, stdout, session.take_raw()))
}

fn upload(
    session: &mut InteractiveSession,
    shell: &Regex,
    source: impl Read,
    remote: &str,
    mark: &Mark,
    chunk_size: usize,
    deadline: &Deadline,
) -> Result<()> {
    session.sendline(&framing::upload_command(remote, mark))?;

    let mut chunks = 0usize;
    for line in ChunkEncoder::new(source, chunk_size) {
        session.sendline(&line?)?;
        chunks += 1;
    }
    debug!("Sent {} chunks", chunks);

    session.sendline("")?;
    session.send_control('d')?;

    loop {
        let line = session.readline_until(deadline)?;
        session.take_raw();
        if framing::classify(mark, &line) == LineKind::Terminator {
            break;
        }
    }
    session.expect_until(shell, deadline)?;
    Ok(())
}

fn download(
    session: &mut InteractiveSession,
    shell: &Regex,
    mut sink: impl Write,
    remote: &str,
    mark: &Mark,
    deadline: &Deadline,
) -> Result<u64> {
    session.sendline(&framing::download_command(remote, mark))?;

    // Lines seen before the command echo are console noise, unless the
    // console does not echo at all.
    let mut early = Vec::new();
    let mut echoed = false;
    let mut written = 0u64;
    loop {
        let line = session.readline_until(deadline)?;
        // The encoded stream is not worth keeping as raw history.
        session.take_raw();
        match framing::classify(mark, &line) {
            LineKind::Terminator => break,
            LineKind::Echo => {
                echoed = true;
                early.clear();
            }
            LineKind::Content if line.trim().is_empty() => {}
            LineKind::Content if echoed => written += write_decoded(&mut sink, &line)?,
            LineKind::Content => early.push(line),
        }
    }
    for line in &early {
        written += write_decoded(&mut sink, line)?;
    }
    sink.flush()?;

    session.expect_until(shell, deadline)?;
    Ok(written)
}

fn write_decoded(sink: &mut impl Write, line: &str) -> Result<u64> {
    let bytes = framing::decode_line(line)
        .map_err(|e| Error::Other(format!("invalid base64 line {line:?}: {e}")))?;
    sink.write_all(&bytes)?;
    Ok(bytes.len() as u64)
}

fn transfer_error(path: &str, mark: &Mark, err: impl std::fmt::Display) -> Error {
    Error::FileTransfer {
        path: path.to_string(),
        mark: mark.clone(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use vm_console_core::{ConsoleSettings, Timeouts};

    /// getty + shell stand-in: login `root`, password `secret`, prompt `# `.
    const FAKE_CONSOLE: &str = r#"
stty -echo
while :; do
  printf 'login: '
  IFS= read -r user || exit 0
  printf '%s\n' "$user"
  [ -n "$user" ] || continue
  printf 'Password: '
  IFS= read -r pass || exit 0
  printf '\n'
  if [ "$user" != root ] || [ "$pass" != secret ]; then
    printf 'Login incorrect\n'
    continue
  fi
  printf 'Last login: never\n'
  while printf '# ' && IFS= read -r line; do
    printf '%s\n' "$line"
    eval "$line"
  done
  printf '\nlogout\n'
done
"#;

    fn config_for(script: &str, password: &str) -> TransportConfig {
        TransportConfig {
            console: ConsoleSettings {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                ..Default::default()
            },
            credentials: Credentials::new("root", password),
            timeouts: Timeouts {
                login_ms: 5_000,
                command_ms: 5_000,
                transfer_ms: 10_000,
                close_ms: 2_000,
                poll_interval_ms: 100,
            },
            ..Default::default()
        }
    }

    fn transport(password: &str) -> ConsoleTransport {
        ConsoleTransport::new(
            ConsoleTarget::new("fake-vm"),
            config_for(FAKE_CONSOLE, password),
        )
        .unwrap()
    }

    fn connected() -> ConsoleTransport {
        let mut console = transport("secret");
        console.connect().unwrap();
        console
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = TransportConfig::default();
        config.prompts.shell = "([".to_string();
        let result = ConsoleTransport::new(ConsoleTarget::new("vm"), config);
        assert!(result.is_err());
    }

    #[test]
    fn test_operations_require_connection() {
        let mut console = transport("secret");
        assert_eq!(console.state(), TransportState::Disconnected);
        assert!(matches!(
            console.exec_command("true"),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            console.fetch_file("/etc/hostname", Path::new("/nonexistent/dir/out")),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_put_file_checks_local_file_first() {
        let mut console = transport("secret");
        let missing = Path::new("/nonexistent/payload.bin");
        match console.put_file(missing, "/tmp/payload.bin") {
            Err(Error::LocalFileNotFound(path)) => assert_eq!(path, missing),
            other => panic!("expected LocalFileNotFound, got {other:?}"),
        }
        assert_eq!(console.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_connect_and_exec() {
        let mut console = connected();
        assert_eq!(console.state(), TransportState::Ready);

        let result = console.exec_command("echo hi").unwrap();
        assert_eq!(result.return_code, 0);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.stderr, "");
        assert!(!result.raw.is_empty());
        assert_eq!(console.state(), TransportState::Ready);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut console = connected();
        console.connect().unwrap();
        assert!(console.is_connected());
    }

    #[test]
    fn test_exec_non_zero_return_code() {
        let mut console = connected();
        let result = console.exec_command("sh -c 'echo oops; exit 3'").unwrap();
        assert_eq!(result.return_code, 3);
        assert_eq!(result.stdout, "oops\n");
    }

    #[test]
    fn test_exec_numeric_output() {
        let mut console = connected();
        let result = console.exec_command("printf '5\\n7\\n'").unwrap();
        assert_eq!(result.return_code, 0);
        assert_eq!(result.stdout, "5\n7\n");
    }

    #[test]
    fn test_exec_unterminated_output_keeps_session() {
        let mut console = connected();
        match console.exec_command("printf abc") {
            Err(Error::OutputParse { output, .. }) => assert_eq!(output, "abc0\n"),
            other => panic!("expected OutputParse, got {other:?}"),
        }
        assert!(console.is_connected());
        assert_eq!(console.exec_command("echo next").unwrap().stdout, "next\n");
    }

    #[test]
    fn test_exec_timeout_disconnects() {
        let mut config = config_for(FAKE_CONSOLE, "secret");
        config.timeouts.command_ms = 300;
        let mut console = ConsoleTransport::new(ConsoleTarget::new("fake-vm"), config).unwrap();
        console.connect().unwrap();

        let result = console.exec_command("sleep 5");
        assert!(matches!(result, Err(Error::SessionTimeout { .. })));
        assert_eq!(console.state(), TransportState::Disconnected);
        assert!(matches!(
            console.exec_command("true"),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_wrong_password_fails_authentication() {
        let mut config = config_for(FAKE_CONSOLE, "wrong");
        config.timeouts.login_ms = 1_000;
        let mut console = ConsoleTransport::new(ConsoleTarget::new("fake-vm"), config).unwrap();

        match console.connect() {
            Err(Error::Authentication { stage, buffer }) => {
                assert_eq!(stage, AuthStage::ShellPrompt);
                assert!(buffer.contains("Login incorrect"));
            }
            other => panic!("expected Authentication, got {other:?}"),
        }
        assert_eq!(console.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_spawn_failure_leaves_disconnected() {
        let mut config = config_for(FAKE_CONSOLE, "secret");
        config.console.command = "/nonexistent/virtctl".to_string();
        let mut console = ConsoleTransport::new(ConsoleTarget::new("vm"), config).unwrap();

        assert!(matches!(console.connect(), Err(Error::SessionSpawn { .. })));
        assert_eq!(console.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_put_and_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("payload.bin");
        let remote = dir.path().join("remote copy.bin");
        let back = dir.path().join("back.bin");
        let payload: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&local, &payload).unwrap();

        let mut console = connected();
        let remote = remote.to_str().unwrap();
        console.put_file(&local, remote).unwrap();
        assert_eq!(std::fs::read(remote).unwrap(), payload);

        console.fetch_file(remote, &back).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), payload);
        assert_eq!(console.state(), TransportState::Ready);
    }

    #[test]
    fn test_put_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("empty");
        let remote = dir.path().join("empty.remote");
        std::fs::write(&local, b"").unwrap();

        let mut console = connected();
        console.put_file(&local, remote.to_str().unwrap()).unwrap();
        assert_eq!(std::fs::read(&remote).unwrap(), b"");
    }

    #[test]
    fn test_fetch_invalid_base64_is_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake_base64 = dir.path().join("base64");
        std::fs::write(&fake_base64, "#!/bin/sh\necho '!!not base64!!'\n").unwrap();
        let script = format!(
            "chmod +x '{}'; PATH='{}':$PATH; {}",
            fake_base64.display(),
            dir.path().display(),
            FAKE_CONSOLE
        );
        let config = config_for(&script, "secret");
        let mut console = ConsoleTransport::new(ConsoleTarget::new("fake-vm"), config).unwrap();
        console.connect().unwrap();

        let out = dir.path().join("out");
        match console.fetch_file("/etc/hostname", &out) {
            Err(Error::FileTransfer { path, reason, .. }) => {
                assert_eq!(path, "/etc/hostname");
                assert!(reason.contains("invalid base64"));
            }
            other => panic!("expected FileTransfer, got {other:?}"),
        }
        assert_eq!(console.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_transfer_timeouts_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("payload");
        std::fs::write(&local, b"payload").unwrap();
        // A base64 that never answers.
        let script = format!("base64() {{ sleep 30; }}\n{FAKE_CONSOLE}");
        let mut config = config_for(&script, "secret");
        config.timeouts.transfer_ms = 500;
        let mut console = ConsoleTransport::new(ConsoleTarget::new("fake-vm"), config).unwrap();

        console.connect().unwrap();
        let remote = dir.path().join("remote");
        let remote = remote.to_str().unwrap();
        let start = Instant::now();
        match console.put_file(&local, remote) {
            Err(Error::FileTransfer { path, reason, .. }) => {
                assert_eq!(path, remote);
                assert!(reason.contains("Timed out after 500ms"));
            }
            other => panic!("expected FileTransfer, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(console.state(), TransportState::Disconnected);

        console.connect().unwrap();
        let start = Instant::now();
        match console.fetch_file("/etc/hostname", &dir.path().join("out")) {
            Err(Error::FileTransfer { path, reason, .. }) => {
                assert_eq!(path, "/etc/hostname");
                assert!(reason.contains("Timed out after 500ms"));
            }
            other => panic!("expected FileTransfer, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(console.state(), TransportState::Disconnected);
        assert!(!console.is_connected());
    }

    #[test]
    fn test_close_logs_out() {
        let mut console = connected();
        let start = Instant::now();
        console.close().unwrap();
        assert_eq!(console.state(), TransportState::Disconnected);
        assert!(start.elapsed() < Duration::from_secs(2));
        console.close().unwrap();
    }

    #[test]
    fn test_close_without_logout_prompt_still_disconnects() {
        let mut console = connected();
        console.prompts.login = Regex::new("never-shown-prompt").unwrap();
        console.config.timeouts.close_ms = 300;

        let start = Instant::now();
        console.close().unwrap();
        assert_eq!(console.state(), TransportState::Disconnected);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_force_close() {
        let mut console = connected();
        console.force_close();
        assert_eq!(console.state(), TransportState::Disconnected);
        assert!(!console.is_connected());
    }

    #[test]
    fn test_connect_when_available_retries_until_console_stays_up() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let script = format!(
            "n=$(cat '{c}' 2>/dev/null || echo 0); echo $((n + 1)) > '{c}'; [ \"$n\" -ge 2 ] || exit 0; {}",
            FAKE_CONSOLE,
            c = counter.display()
        );
        let mut console =
            ConsoleTransport::new(ConsoleTarget::new("fake-vm"), config_for(&script, "secret"))
                .unwrap();

        console
            .connect_when_available(Duration::from_secs(10))
            .unwrap();
        assert!(console.is_connected());
        let attempts: u32 = std::fs::read_to_string(&counter)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_connect_when_available_times_out() {
        let mut console = ConsoleTransport::new(
            ConsoleTarget::new("fake-vm"),
            config_for("exit 0", "secret"),
        )
        .unwrap();

        match console.connect_when_available(Duration::from_millis(500)) {
            Err(Error::TimeoutExpired { attempts, .. }) => assert!(attempts >= 2),
            other => panic!("expected TimeoutExpired, got {other:?}"),
        }
        assert_eq!(console.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_connect_when_available_spawn_failure_is_fatal() {
        let mut config = config_for(FAKE_CONSOLE, "secret");
        config.console.command = "/nonexistent/virtctl".to_string();
        let mut console = ConsoleTransport::new(ConsoleTarget::new("vm"), config).unwrap();

        let start = Instant::now();
        let result = console.connect_when_available(Duration::from_secs(10));
        assert!(matches!(result, Err(Error::SessionSpawn { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_marks_differ_between_commands() {
        let mut console = connected();
        let first = console.exec_command("echo a").unwrap();
        let second = console.exec_command("echo a").unwrap();
        let marks = |raw: &[u8]| -> String {
            let text = String::from_utf8_lossy(raw).to_string();
            text.split_whitespace()
                .find(|w| w.starts_with("================") && w.len() > 32)
                .unwrap_or_default()
                .to_string()
        };
        assert_ne!(marks(&first.raw), marks(&second.raw));
    }
}
