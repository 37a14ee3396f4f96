//! Supervised external processes.
//!
//! A [`ProcessSession`] launches one helper tool in its own process group,
//! streams its stdout into an append-only line buffer (and to any registered
//! handlers), and records how it terminated. Callers can block on
//! termination from any thread, with or without a deadline, or await it from
//! async code.
//!
//! The buffer keeps the raw bytes, split after each `\n`. Handlers see text
//! segments cut at `\n` and at `\r`, so tools that redraw a progress line
//! with carriage returns are observed while they run.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{LaunchError, ProcessFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    NotStarted,
    Running,
    Suspended,
    Exited,
    Signaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationReason {
    Exit,
    UncaughtSignal,
}

/// How a process ended. For [`TerminationReason::UncaughtSignal`] the status
/// is the signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Termination {
    pub status: i32,
    pub reason: TerminationReason,
}

impl Termination {
    pub fn success(&self) -> bool {
        self.reason == TerminationReason::Exit && self.status == 0
    }

    fn from_exit_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            Self {
                status: code,
                reason: TerminationReason::Exit,
            }
        } else {
            Self {
                status: status.signal().unwrap_or(0),
                reason: TerminationReason::UncaughtSignal,
            }
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            TerminationReason::Exit => write!(f, "exited with status {}", self.status),
            TerminationReason::UncaughtSignal => match Signal::try_from(self.status) {
                Ok(sig) => write!(f, "terminated by signal {} ({})", self.status, sig),
                Err(_) => write!(f, "terminated by signal {}", self.status),
            },
        }
    }
}

/// How long output is still drained after the process has exited. A
/// background child that inherited the pipes can keep them open forever.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

pub type OutputHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type TerminationHandler = Box<dyn FnOnce(&Termination) + Send>;

struct Inner {
    state: SessionState,
    pid: Option<i32>,
    /// Raw stdout split after each newline. Each entry keeps its newline
    /// (the final one may lack it).
    lines: Vec<Vec<u8>>,
    stderr: Vec<u8>,
    termination: Option<Termination>,
    output_handlers: Vec<OutputHandler>,
    termination_handler: Option<TerminationHandler>,
}

struct Shared {
    inner: Mutex<Inner>,
    exited: Condvar,
    termination_tx: watch::Sender<Option<Termination>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, piece: Piece) {
        match piece {
            Piece::Line(line) => self.lock().lines.push(line),
            Piece::Segment(segment) => {
                trace!(segment = %segment, "Process output");
                let handlers = self.lock().output_handlers.clone();
                for handler in &handlers {
                    handler(&segment);
                }
            }
        }
    }

    fn push_stderr(&self, bytes: &[u8]) {
        self.lock().stderr.extend_from_slice(bytes);
    }

    fn finish(&self, termination: Termination) {
        let handler = {
            let mut inner = self.lock();
            inner.termination = Some(termination);
            inner.state = match termination.reason {
                TerminationReason::Exit => SessionState::Exited,
                TerminationReason::UncaughtSignal => SessionState::Signaled,
            };
            inner.termination_handler.take()
        };

        self.exited.notify_all();
        self.termination_tx.send_replace(Some(termination));

        if let Some(handler) = handler {
            handler(&termination);
        }
    }
}

/// One invocation of an external program.
///
/// Configuration is set through the builder methods before [`launch`];
/// once launched the session can be shared (`Arc<ProcessSession>`) between a
/// supervising thread and observers.
///
/// [`launch`]: ProcessSession::launch
pub struct ProcessSession {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    current_dir: Option<PathBuf>,
    runtime: Option<Handle>,
    shared: Arc<Shared>,
}

impl fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSession")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("state", &self.state())
            .finish()
    }
}

impl ProcessSession {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let (termination_tx, _) = watch::channel(None);
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            current_dir: None,
            runtime: None,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::NotStarted,
                    pid: None,
                    lines: Vec::new(),
                    stderr: Vec::new(),
                    termination: None,
                    output_handlers: Vec::new(),
                    termination_handler: None,
                }),
                exited: Condvar::new(),
                termination_tx,
            }),
        }
    }

    /// Create and immediately launch a session.
    pub fn launched<I, S>(program: impl Into<PathBuf>, args: I) -> Result<Self, LaunchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let session = Self::new(program).args(args);
        session.launch()?;
        Ok(session)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a variable on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Runtime used to supervise the child. Defaults to the ambient runtime
    /// at launch time.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Register a handler receiving stdout in production order, one segment
    /// per `\n` or `\r` terminator (terminator stripped, invalid UTF-8
    /// replaced). Output already seen is not replayed.
    pub fn on_output<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.lock().output_handlers.push(Arc::new(handler));
    }

    /// Register the termination handler. It runs exactly once; if the
    /// process has already terminated it runs immediately.
    pub fn on_termination<F>(&self, handler: F)
    where
        F: FnOnce(&Termination) + Send + 'static,
    {
        let mut inner = self.shared.lock();
        match inner.termination {
            Some(termination) => {
                drop(inner);
                handler(&termination);
            }
            None => inner.termination_handler = Some(Box::new(handler)),
        }
    }

    pub fn launch(&self) -> Result<(), LaunchError> {
        let mut inner = self.shared.lock();
        if inner.state != SessionState::NotStarted {
            return Err(LaunchError::AlreadyLaunched);
        }

        if let Some(dir) = &self.current_dir {
            if !dir.is_dir() {
                return Err(LaunchError::InvalidWorkingDirectory(dir.clone()));
            }
        }

        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| LaunchError::NoRuntime)?,
        };
        let _guard = runtime.enter();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => LaunchError::NotFound(self.program.clone()),
            ErrorKind::PermissionDenied => LaunchError::PermissionDenied(self.program.clone()),
            _ => LaunchError::Spawn {
                program: self.program.clone(),
                source: e,
            },
        })?;

        let pid = child.id().map(|id| id as i32);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        inner.pid = pid;
        inner.state = SessionState::Running;
        drop(inner);

        debug!(
            program = %self.program.display(),
            args = ?self.args,
            pid = ?pid,
            "Launched process"
        );

        runtime.spawn(supervise(child, stdout, stderr, self.shared.clone()));
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn pid(&self) -> Option<i32> {
        self.shared.lock().pid
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Running | SessionState::Suspended
        )
    }

    pub fn termination(&self) -> Option<Termination> {
        self.shared.lock().termination
    }

    /// Send `signal` to the process group. Does not wait for termination.
    pub fn kill(&self, signal: Signal) -> nix::Result<()> {
        let (pid, suspended) = {
            let inner = self.shared.lock();
            match (inner.state, inner.pid) {
                (SessionState::Running, Some(pid)) => (pid, false),
                (SessionState::Suspended, Some(pid)) => (pid, true),
                _ => return Err(Errno::ESRCH),
            }
        };

        debug!(pid, %signal, "Signalling process group");
        killpg(Pid::from_raw(pid), signal)?;

        // A stopped group only acts on the signal once continued.
        if suspended && signal != Signal::SIGKILL && signal != Signal::SIGCONT {
            killpg(Pid::from_raw(pid), Signal::SIGCONT)?;
            let mut inner = self.shared.lock();
            if inner.state == SessionState::Suspended {
                inner.state = SessionState::Running;
            }
        }
        Ok(())
    }

    /// Stop the process group. Returns false unless the session was running.
    pub fn suspend(&self) -> bool {
        self.transition(SessionState::Running, SessionState::Suspended, Signal::SIGSTOP)
    }

    /// Continue a suspended process group. Returns false unless suspended.
    pub fn resume(&self) -> bool {
        self.transition(SessionState::Suspended, SessionState::Running, Signal::SIGCONT)
    }

    fn transition(&self, from: SessionState, to: SessionState, signal: Signal) -> bool {
        let mut inner = self.shared.lock();
        let Some(pid) = inner.pid else {
            return false;
        };
        if inner.state != from {
            return false;
        }

        match killpg(Pid::from_raw(pid), signal) {
            Ok(()) => {
                inner.state = to;
                true
            }
            Err(e) => {
                warn!(pid, %signal, error = %e, "Failed to signal process group");
                false
            }
        }
    }

    /// Block until the process has exited or was killed. Returns `None` if the
    /// session was never launched.
    pub fn wait_until_exit(&self) -> Option<Termination> {
        let mut inner = self.shared.lock();
        if inner.state == SessionState::NotStarted {
            return None;
        }
        while inner.termination.is_none() {
            inner = self
                .shared
                .exited
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        inner.termination
    }

    /// Block until exit or `deadline`, whichever comes first. Returns whether
    /// the process had terminated. The process is left running on timeout.
    pub fn wait_until_exit_before(&self, deadline: Instant) -> bool {
        let mut inner = self.shared.lock();
        if inner.state == SessionState::NotStarted {
            return false;
        }
        while inner.termination.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .shared
                .exited
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }

    /// Await termination from async code.
    pub async fn wait(&self) -> Option<Termination> {
        if self.state() == SessionState::NotStarted {
            return None;
        }
        let mut rx = self.shared.termination_tx.subscribe();
        let termination = rx.wait_for(Option::is_some).await.ok()?;
        *termination
    }

    /// Block until termination and turn anything but a clean exit into a
    /// [`ProcessFailure`] carrying the captured output.
    pub fn wait_for_success(&self) -> Result<Termination, ProcessFailure> {
        let termination = self.wait_until_exit().ok_or_else(|| ProcessFailure {
            program: self.program.clone(),
            termination: Termination {
                status: -1,
                reason: TerminationReason::Exit,
            },
            output: String::new(),
        })?;

        if termination.success() {
            return Ok(termination);
        }

        let inner = self.shared.lock();
        let mut output = inner.lines.concat();
        output.extend_from_slice(&inner.stderr);
        Err(ProcessFailure {
            program: self.program.clone(),
            termination,
            output: String::from_utf8_lossy(&output).into_owned(),
        })
    }

    /// All stdout captured so far, exactly as the process wrote it.
    pub fn output_bytes(&self) -> Vec<u8> {
        self.shared.lock().lines.concat()
    }

    /// All stdout captured so far as text. Invalid UTF-8 is replaced.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output_bytes()).into_owned()
    }

    /// Snapshot of the captured stdout lines as text, each with its newline.
    pub fn lines(&self) -> Vec<String> {
        self.shared
            .lock()
            .lines
            .iter()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Captured stderr. Only complete once the process has terminated.
    pub fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.shared.lock().stderr).into_owned()
    }

    /// Parse the captured stdout as JSON. `None` if it does not parse.
    pub fn output_json(&self) -> Option<serde_json::Value> {
        self.output_structured()
    }

    pub fn output_structured<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_slice(&self.output_bytes()).ok()
    }
}

/// Unit of stdout handed from the reader to the shared state.
#[derive(Debug, PartialEq, Eq)]
enum Piece {
    /// A complete buffer line, newline included.
    Line(Vec<u8>),
    /// Text up to a `\n` or `\r`, terminator excluded.
    Segment(String),
}

/// Cuts a byte stream into buffer lines and handler segments.
#[derive(Default)]
struct LineSplitter {
    line: Vec<u8>,
    segment_start: usize,
    after_cr: bool,
}

impl LineSplitter {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Piece> {
        let mut pieces = Vec::new();
        for &byte in bytes {
            self.line.push(byte);
            if byte != b'\n' && byte != b'\r' {
                self.after_cr = false;
                continue;
            }

            let segment = &self.line[self.segment_start..self.line.len() - 1];
            // The `\n` of a `\r\n` pair does not end another segment.
            let crlf = segment.is_empty() && self.after_cr && byte == b'\n';
            let segment = (!crlf).then(|| String::from_utf8_lossy(segment).into_owned());
            self.after_cr = byte == b'\r';

            if byte == b'\n' {
                pieces.push(Piece::Line(std::mem::take(&mut self.line)));
                self.segment_start = 0;
            } else {
                self.segment_start = self.line.len();
            }
            if let Some(segment) = segment {
                pieces.push(Piece::Segment(segment));
            }
        }
        pieces
    }

    /// Flush an unterminated tail at end of stream.
    fn finish(&mut self) -> Vec<Piece> {
        let mut pieces = Vec::new();
        if self.line.is_empty() {
            return pieces;
        }
        let segment = &self.line[self.segment_start..];
        let segment = (!segment.is_empty()).then(|| String::from_utf8_lossy(segment).into_owned());
        pieces.push(Piece::Line(std::mem::take(&mut self.line)));
        if let Some(segment) = segment {
            pieces.push(Piece::Segment(segment));
        }
        self.segment_start = 0;
        pieces
    }
}

async fn read_stdout(
    stdout: Option<impl AsyncRead + Unpin>,
    splitter: &mut LineSplitter,
    shared: &Shared,
) {
    let Some(mut stdout) = stdout else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for piece in splitter.feed(&chunk[..n]) {
                    shared.apply(piece);
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read process stdout");
                break;
            }
        }
    }
}

/// Drain stdout and stderr while waiting for the child, then record the
/// termination. Output still arriving [`DRAIN_GRACE`] after exit is dropped.
async fn supervise(
    mut child: Child,
    stdout: Option<impl AsyncRead + Unpin + Send + 'static>,
    stderr: Option<impl AsyncRead + Unpin + Send + 'static>,
    shared: Arc<Shared>,
) {
    let mut stderr_task = {
        let shared = shared.clone();
        tokio::spawn(async move {
            let Some(mut stderr) = stderr else {
                return;
            };
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => shared.push_stderr(&chunk[..n]),
                    Err(e) => {
                        warn!(error = %e, "Failed to read process stderr");
                        break;
                    }
                }
            }
        })
    };

    let mut splitter = LineSplitter::default();
    let mut status = None;
    {
        let drain = read_stdout(stdout, &mut splitter, &shared);
        tokio::pin!(drain);
        let mut drained = false;

        while status.is_none() || !drained {
            tokio::select! {
                result = child.wait(), if status.is_none() => status = Some(result),
                _ = &mut drain, if !drained => drained = true,
                _ = tokio::time::sleep(DRAIN_GRACE), if status.is_some() => {
                    debug!("Process exited with its stdout still open");
                    break;
                }
            }
        }
    }
    for piece in splitter.finish() {
        shared.apply(piece);
    }

    if tokio::time::timeout(DRAIN_GRACE, &mut stderr_task).await.is_err() {
        debug!("Process exited with its stderr still open");
        stderr_task.abort();
        let _ = stderr_task.await;
    }

    let termination = match status {
        Some(Ok(status)) => Termination::from_exit_status(status),
        other => {
            if let Some(Err(e)) = other {
                warn!(error = %e, "Failed to collect process exit status");
            }
            Termination {
                status: -1,
                reason: TerminationReason::Exit,
            }
        }
    };

    debug!(%termination, "Process terminated");
    shared.finish(termination);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::ProgressFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sh(script: &str) -> ProcessSession {
        ProcessSession::new("/bin/sh").args(["-c", script])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_captures_printf_output() {
        let session = ProcessSession::new("printf").arg("line1\\nline2\\n");
        session.launch().unwrap();

        let termination = session.wait().await.unwrap();

        assert_eq!(session.output(), "line1\nline2\n");
        assert_eq!(session.lines(), vec!["line1\n", "line2\n"]);
        assert_eq!(
            termination,
            Termination {
                status: 0,
                reason: TerminationReason::Exit
            }
        );
        assert_eq!(session.state(), SessionState::Exited);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_keeps_unterminated_last_line() {
        let session = sh("printf 'a\\nb'");
        session.launch().unwrap();
        session.wait().await;

        assert_eq!(session.lines(), vec!["a\n", "b"]);
        assert_eq!(session.output(), "a\nb");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_high_volume_output_is_ordered_and_complete() {
        let session = ProcessSession::new("seq").args(["1", "50000"]);
        session.launch().unwrap();
        session.wait().await.unwrap();

        let expected: String = (1..=50000).map(|n| format!("{n}\n")).collect();
        assert_eq!(session.output(), expected);
        assert_eq!(session.lines().len(), 50000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_output_handler_sees_lines_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let session = sh("echo one; echo two; echo three");
        {
            let seen = seen.clone();
            session.on_output(move |line| seen.lock().unwrap().push(line.to_string()));
        }
        session.launch().unwrap();
        session.wait().await;

        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nonzero_exit_is_recorded() {
        let session = sh("echo failing; echo oops >&2; exit 3");
        session.launch().unwrap();
        let termination = session.wait().await.unwrap();

        assert_eq!(termination.status, 3);
        assert_eq!(termination.reason, TerminationReason::Exit);
        assert!(!termination.success());

        let failure = session.wait_for_success().unwrap_err();
        assert!(failure.output.contains("failing"));
        assert!(failure.output.contains("oops"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_signal_termination_is_recorded() {
        let session = sh("kill -9 $$");
        session.launch().unwrap();
        let termination = session.wait().await.unwrap();

        assert_eq!(termination.reason, TerminationReason::UncaughtSignal);
        assert_eq!(termination.status, libc::SIGKILL);
        assert_eq!(session.state(), SessionState::Signaled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_launch_missing_program() {
        let session = ProcessSession::new("/nonexistent/definitely-not-here");
        let err = session.launch().unwrap_err();
        assert!(matches!(err, LaunchError::NotFound(_)));
        assert_eq!(session.state(), SessionState::NotStarted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_launch_invalid_working_directory() {
        let session = sh("true").current_dir("/nonexistent/dir");
        let err = session.launch().unwrap_err();
        assert!(matches!(err, LaunchError::InvalidWorkingDirectory(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_launch_twice_is_rejected() {
        let session = sh("true");
        session.launch().unwrap();
        assert!(matches!(
            session.launch().unwrap_err(),
            LaunchError::AlreadyLaunched
        ));
        session.wait().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_environment_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let session = sh("echo \"$XR_TEST_VAR\"; pwd")
            .env("XR_TEST_VAR", "hello")
            .current_dir(dir.path());
        session.launch().unwrap();
        session.wait().await;

        let lines = session.lines();
        assert_eq!(lines[0], "hello\n");
        let cwd = PathBuf::from(lines[1].trim());
        assert_eq!(
            cwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deadline_wait_does_not_kill() {
        let session = Arc::new(ProcessSession::new("sleep").arg("5"));
        session.launch().unwrap();

        let waiter = session.clone();
        let exited = tokio::task::spawn_blocking(move || {
            waiter.wait_until_exit_before(Instant::now() + Duration::from_millis(100))
        })
        .await
        .unwrap();

        assert!(!exited);
        assert!(session.is_running());

        session.kill(Signal::SIGKILL).unwrap();
        let termination = session.wait().await.unwrap();
        assert_eq!(termination.reason, TerminationReason::UncaughtSignal);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_waiters_agree_and_handler_fires_once() {
        let session = Arc::new(sh("sleep 0.3; exit 7"));
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            session.on_termination(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        session.launch().unwrap();

        let mut deadline_waiters = Vec::new();
        for _ in 0..4 {
            let s = session.clone();
            deadline_waiters.push(tokio::task::spawn_blocking(move || {
                let done = s.wait_until_exit_before(Instant::now() + Duration::from_secs(10));
                (done, s.termination())
            }));
        }
        let mut blocking_waiters = Vec::new();
        for _ in 0..4 {
            let s = session.clone();
            blocking_waiters.push(tokio::task::spawn_blocking(move || s.wait_until_exit()));
        }

        let expected = Termination {
            status: 7,
            reason: TerminationReason::Exit,
        };
        for waiter in deadline_waiters {
            let (done, termination) = waiter.await.unwrap();
            assert!(done);
            assert_eq!(termination, Some(expected));
        }
        for waiter in blocking_waiters {
            assert_eq!(waiter.await.unwrap(), Some(expected));
        }
        assert_eq!(session.wait().await, Some(expected));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handler_registered_after_exit_runs_once() {
        let session = sh("exit 0");
        session.launch().unwrap();
        session.wait().await;

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        session.on_termination(move |t| {
            assert!(t.success());
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_suspend_and_resume() {
        let session = ProcessSession::new("sleep").arg("5");
        assert!(!session.suspend());

        session.launch().unwrap();
        assert!(!session.resume(), "resume on a running process");
        assert!(session.suspend());
        assert_eq!(session.state(), SessionState::Suspended);
        assert!(!session.suspend(), "suspend twice");
        assert!(session.resume());
        assert_eq!(session.state(), SessionState::Running);

        session.kill(Signal::SIGTERM).unwrap();
        let termination = session.wait().await.unwrap();
        assert_eq!(termination.status, libc::SIGTERM);
        assert!(!session.resume());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_suspended_process_terminates_it() {
        let session = ProcessSession::new("sleep").arg("5");
        session.launch().unwrap();
        assert!(session.suspend());

        session.kill(Signal::SIGTERM).unwrap();
        let termination = session.wait().await.unwrap();
        assert_eq!(termination.reason, TerminationReason::UncaughtSignal);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_before_launch_fails() {
        let session = ProcessSession::new("true");
        assert_eq!(session.kill(Signal::SIGTERM), Err(Errno::ESRCH));
        assert_eq!(session.wait().await, None);
        assert_eq!(session.wait_until_exit(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_structured_output() {
        let session = ProcessSession::new("printf").arg(r#"{"device": "/dev/loop3"}"#);
        session.launch().unwrap();
        session.wait().await;

        let value = session.output_json().unwrap();
        assert_eq!(value["device"], "/dev/loop3");

        let garbage = sh("echo not json");
        garbage.launch().unwrap();
        garbage.wait().await;
        assert!(garbage.output_json().is_none());
    }

    #[test]
    fn test_splitter_cuts_segments_on_carriage_returns() {
        let mut splitter = LineSplitter::default();
        let mut pieces = splitter.feed(b"  1  10%\r  2  5");
        pieces.extend(splitter.feed(b"0%\r done\r\n"));
        pieces.extend(splitter.feed(b"tail"));
        pieces.extend(splitter.finish());

        assert_eq!(
            pieces,
            vec![
                Piece::Segment("  1  10%".to_string()),
                Piece::Segment("  2  50%".to_string()),
                Piece::Segment(" done".to_string()),
                Piece::Line(b"  1  10%\r  2  50%\r done\r\n".to_vec()),
                Piece::Line(b"tail".to_vec()),
                Piece::Segment("tail".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_carriage_return_progress_is_seen_while_running() {
        let fractions = Arc::new(Mutex::new(Vec::new()));
        let session = sh(
            "printf '  100  10%%\\r'; sleep 1; printf '  500  50%%\\r'; sleep 1; printf '  900 100%%\\n'",
        );
        {
            let fractions = fractions.clone();
            session.on_output(move |segment| {
                if let Some(fraction) = ProgressFormat::Rsync.parse(segment) {
                    fractions.lock().unwrap().push(fraction);
                }
            });
        }
        session.launch().unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*fractions.lock().unwrap(), vec![0.1]);
        assert!(session.is_running());

        session.wait().await.unwrap();
        assert_eq!(*fractions.lock().unwrap(), vec![0.1, 0.5, 1.0]);
        assert_eq!(session.output(), "  100  10%\r  500  50%\r  900 100%\n");
        assert_eq!(session.lines().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exit_is_reported_while_background_child_holds_stdout() {
        let session = Arc::new(sh("sleep 3 & echo started; exit 0"));
        session.launch().unwrap();

        let started = Instant::now();
        let waiter = session.clone();
        let exited = tokio::task::spawn_blocking(move || {
            waiter.wait_until_exit_before(Instant::now() + Duration::from_secs(2))
        })
        .await
        .unwrap();

        assert!(exited);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), SessionState::Exited);
        assert_eq!(session.output(), "started\n");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_launched_starts_immediately() {
        let session = ProcessSession::launched("printf", ["a\\n"]).unwrap();
        assert_ne!(session.state(), SessionState::NotStarted);

        session.wait().await.unwrap();
        assert_eq!(session.output(), "a\n");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stderr_is_kept_separately() {
        let session = sh("echo out; echo err >&2");
        session.launch().unwrap();
        session.wait().await;

        assert_eq!(session.output(), "out\n");
        assert_eq!(session.error_output(), "err\n");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_utf8_output_is_buffered_raw() {
        let session = sh("printf 'caf\\351\\n'");
        session.launch().unwrap();
        session.wait().await;

        assert_eq!(session.output_bytes(), b"caf\xe9\n".to_vec());
        assert_eq!(session.output(), "caf\u{FFFD}\n");
    }
}
