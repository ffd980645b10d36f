use super::Result;
use crate::error::HarnessError;
use crate::output::{capture, OutputBuffer};
use eyre::eyre;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long reader tasks get to drain the pipes once the child is reaped
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A fully resolved command line for one program under test
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments for the executable
    pub args: Vec<String>,
    /// Environment variables added on top of the harness environment
    pub environment: HashMap<String, String>,
    /// Bytes fed to the program's stdin
    pub stdin: Option<StdinPayload>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
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

    pub fn stdin(mut self, payload: StdinPayload) -> Self {
        self.stdin = Some(payload);
        self
    }

    /// The command line as a single printable string
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Data written to stdin, after which stdin is closed
#[derive(Debug, Clone)]
pub struct StdinPayload {
    pub data: Vec<u8>,
    /// Hold the write back until this marker shows up in the output
    pub send_after: Option<Vec<u8>>,
}

/// Which captured streams a marker is searched in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerStreams {
    #[default]
    Stdout,
    Both,
}

/// Output pattern that ends a process which never exits on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillMarker {
    pub pattern: Vec<u8>,
    pub streams: MarkerStreams,
}

impl KillMarker {
    pub fn stdout(pattern: impl Into<Vec<u8>>) -> Self {
        Self {
            pattern: pattern.into(),
            streams: MarkerStreams::Stdout,
        }
    }

    pub fn any_stream(pattern: impl Into<Vec<u8>>) -> Self {
        Self {
            pattern: pattern.into(),
            streams: MarkerStreams::Both,
        }
    }
}

/// Termination policy for a running process
#[derive(Debug, Clone)]
pub struct WatchPolicy {
    /// Wall-clock budget before the process is terminated as hung
    pub timeout: Duration,
    /// Optional marker that triggers termination once seen
    pub kill_marker: Option<KillMarker>,
    /// Time between SIGTERM and SIGKILL when terminating
    pub grace: Duration,
}

impl WatchPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            kill_marker: None,
            grace: Duration::from_secs(2),
        }
    }

    pub fn with_kill_marker(mut self, marker: Option<KillMarker>) -> Self {
        self.kill_marker = marker;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// State of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not launched yet
    NotStarted,
    /// Launched and not yet terminal
    Running,
    /// Exited on its own
    Exited,
    /// Terminated by the harness, either on a kill marker or explicitly
    Killed,
    /// Terminated after exceeding its timeout
    TimedOut,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::TimedOut)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot of a process that reached a terminal state
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub name: String,
    pub command: String,
    pub state: ProcessState,
    /// Exit code, `None` when the process died from a signal
    pub exit_code: Option<i32>,
    /// Signal that terminated the process
    pub signal: Option<i32>,
    /// Whether termination was triggered by the kill marker
    pub marker_matched: bool,
    pub duration: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessResult {
    pub fn output_streams(&self) -> [&[u8]; 2] {
        [&self.stdout, &self.stderr]
    }

    pub fn stdout_contains(&self, pattern: &[u8]) -> bool {
        crate::output::find_subslice(&self.stdout, pattern, 0).is_some()
    }

    /// True if either stream contains `pattern`
    pub fn streams_contain(&self, pattern: &[u8]) -> bool {
        self.output_streams()
            .iter()
            .any(|stream| crate::output::find_subslice(stream, pattern, 0).is_some())
    }

    /// Human-readable dump used in failure reports
    pub fn describe(&self) -> String {
        let exit = match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "no exit status".to_string(),
        };
        format!(
            "--- {} [{}; {}{}; {:.2?}]\n$ {}\n--- stdout ---\n{}\n--- stderr ---\n{}",
            self.name,
            self.state,
            exit,
            if self.marker_matched { "; kill marker seen" } else { "" },
            self.duration,
            self.command,
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr),
        )
    }
}

/// Owns the lifecycle of one external program under test.
///
/// After `start`, a supervisor task races three watchers: natural exit,
/// the timeout, and the optional kill marker. The first one to fire decides
/// the terminal state; the others are dropped with it.
pub struct ManagedProcess {
    name: String,
    spec: LaunchSpec,
    state: Arc<watch::Sender<ProcessState>>,
    stdout: Arc<OutputBuffer>,
    stderr: Arc<OutputBuffer>,
    cancel: CancellationToken,
    pid: Option<Pid>,
    supervisor: Option<JoinHandle<Result<ProcessResult>>>,
    result: Option<ProcessResult>,
}

impl ManagedProcess {
    /// Creates a process in the `NotStarted` state
    ///
    /// # Arguments
    /// * `name` - Label used in logs and failure reports
    /// * `spec` - Command line to launch
    pub fn new(name: impl Into<String>, spec: LaunchSpec) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            name: name.into(),
            spec,
            state: Arc::new(state),
            stdout: Arc::new(OutputBuffer::new()),
            stderr: Arc::new(OutputBuffer::new()),
            cancel: CancellationToken::new(),
            pid: None,
            supervisor: None,
            result: None,
        }
    }

    /// Launches the program and starts its watchers
    ///
    /// # Arguments
    /// * `policy` - Timeout, kill marker and grace period
    ///
    /// # Returns
    /// * `Result<()>` - `HarnessError::Spawn` if the program could not be launched
    pub async fn start(&mut self, policy: WatchPolicy) -> Result<()> {
        if self.state() != ProcessState::NotStarted {
            return Err(eyre!("{} was already started", self.name));
        }

        info!("Spawning {}: {}", self.name, self.spec.command_line());

        let mut command = Command::new(&self.spec.program);
        command.args(&self.spec.args);
        command.envs(&self.spec.environment);

        // Own process group so termination reaches anything the program forks.
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(if self.spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
            program: self.spec.program.clone(),
            source,
        })?;
        let started = Instant::now();

        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid.try_into()?),
            None => return Err(eyre!("Failed to get process ID for {}", self.name)),
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture(stdout, self.stdout.clone(), "stdout")));
        } else {
            self.stdout.close();
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture(stderr, self.stderr.clone(), "stderr")));
        } else {
            self.stderr.close();
        }

        let writer = match (child.stdin.take(), self.spec.stdin.clone()) {
            (Some(stdin), Some(payload)) => Some(tokio::spawn(feed_stdin(
                stdin,
                payload,
                self.stdout.clone(),
                self.stderr.clone(),
            ))),
            _ => None,
        };

        self.pid = Some(pid);
        self.state.send_replace(ProcessState::Running);
        info!("{} spawned with PID: {}", self.name, pid);

        let supervisor = Supervisor {
            name: self.name.clone(),
            command: self.spec.command_line(),
            child,
            pid,
            policy,
            started,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            readers,
            writer,
            cancel: self.cancel.clone(),
            state: self.state.clone(),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run()));
        Ok(())
    }

    /// Waits until the process is terminal and returns its result
    ///
    /// Only this process's task is suspended; other processes keep running.
    ///
    /// # Returns
    /// * `Result<ProcessResult>` - The terminal snapshot
    pub async fn await_result(&mut self) -> Result<ProcessResult> {
        if let Some(ref result) = self.result {
            return Ok(result.clone());
        }
        let supervisor = match self.supervisor.take() {
            Some(supervisor) => supervisor,
            None => return Err(eyre!("{} has not been started", self.name)),
        };

        let result = supervisor
            .await
            .map_err(|e| eyre!("supervisor for {} failed: {}", self.name, e))??;
        self.result = Some(result.clone());
        Ok(result)
    }

    /// Waits up to `within` for `pattern` to appear on stdout or stderr
    ///
    /// # Returns
    /// * `bool` - False on timeout or if both streams closed without it
    pub async fn wait_for_output(&self, pattern: &[u8], within: Duration) -> bool {
        timeout(
            within,
            marker_seen(&self.stdout, &self.stderr, pattern, MarkerStreams::Both),
        )
        .await
        .unwrap_or(false)
    }

    /// Requests termination. Safe to call any number of times, in any state.
    pub fn terminate(&self) {
        if self.state().is_terminal() {
            debug!("{} already terminal, ignoring terminate", self.name);
            return;
        }
        if !self.cancel.is_cancelled() {
            info!("Terminating {}", self.name);
            self.cancel.cancel();
        }
    }

    /// Token that terminates the process when cancelled, usable while the
    /// process itself is borrowed elsewhere
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Bytes captured on stdout so far
    pub fn stdout_snapshot(&self) -> Vec<u8> {
        self.stdout.snapshot()
    }

    /// Bytes captured on stderr so far
    pub fn stderr_snapshot(&self) -> Vec<u8> {
        self.stderr.snapshot()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        // Emergency cleanup: nobody is going to await this process anymore.
        if self.state() == ProcessState::Running {
            self.cancel.cancel();
            if let Some(pid) = self.pid {
                warn!("{} dropped while running (PID: {}), killing process group", self.name, pid);
                if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                    error!("Failed to kill process group {}: {}", pid, e);
                }
            }
        }
    }
}

/// Which watcher fired first
enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    Marker,
    TimedOut,
}

struct Supervisor {
    name: String,
    command: String,
    child: Child,
    pid: Pid,
    policy: WatchPolicy,
    started: Instant,
    stdout: Arc<OutputBuffer>,
    stderr: Arc<OutputBuffer>,
    readers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ProcessState>>,
}

impl Supervisor {
    async fn run(mut self) -> Result<ProcessResult> {
        let outcome = {
            let marker = kill_marker_seen(&self.policy.kill_marker, &self.stdout, &self.stderr);
            tokio::select! {
                // Natural exit wins any tie so a finished process is never
                // reported as killed.
                biased;
                status = self.child.wait() => Outcome::Exited(status),
                _ = self.cancel.cancelled() => Outcome::Cancelled,
                true = marker => Outcome::Marker,
                _ = sleep(self.policy.timeout) => Outcome::TimedOut,
            }
        };

        let (state, status, marker_matched) = match outcome {
            Outcome::Exited(status) => match status {
                Ok(status) => {
                    // Leftover children of the program must not outlive it.
                    let _ = signal_group(self.pid, Signal::SIGKILL);
                    (ProcessState::Exited, status, false)
                }
                Err(e) => {
                    error!("Error waiting for {}: {}", self.name, e);
                    let _ = signal_group(self.pid, Signal::SIGKILL);
                    self.finish(ProcessState::Killed).await;
                    return Err(e.into());
                }
            },
            Outcome::Cancelled => {
                info!("{} cancelled", self.name);
                (ProcessState::Killed, self.shutdown().await?, false)
            }
            Outcome::Marker => {
                info!("{} printed its kill marker, terminating", self.name);
                (ProcessState::Killed, self.shutdown().await?, true)
            }
            Outcome::TimedOut => {
                warn!("{} timed out after {:?}", self.name, self.policy.timeout);
                (ProcessState::TimedOut, self.shutdown().await?, false)
            }
        };

        self.finish(state).await;
        info!("{} {} with status: {:?}", self.name, state, status);

        Ok(ProcessResult {
            name: self.name,
            command: self.command,
            state,
            exit_code: status.code(),
            signal: status.signal(),
            marker_matched,
            duration: self.started.elapsed(),
            stdout: self.stdout.snapshot(),
            stderr: self.stderr.snapshot(),
        })
    }

    /// SIGTERM to the group, then SIGKILL once the grace period runs out
    async fn shutdown(&mut self) -> Result<ExitStatus> {
        if let Err(e) = signal_group(self.pid, Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to {}: {}", self.name, e);
        }

        match timeout(self.policy.grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!("{} ignored SIGTERM, forcing kill", self.name);
                if let Err(e) = signal_group(self.pid, Signal::SIGKILL) {
                    warn!("Failed to send SIGKILL to {}: {}", self.name, e);
                }
                Ok(self.child.wait().await?)
            }
        }
    }

    /// Drains the readers, stops the stdin writer and publishes the state
    async fn finish(&mut self, state: ProcessState) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        for mut reader in self.readers.drain(..) {
            if timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
                debug!("{} output still open after exit, abandoning reader", self.name);
                reader.abort();
            }
        }
        self.stdout.close();
        self.stderr.close();
        self.state.send_replace(state);
    }
}

/// Resolves to `true` once the kill marker is seen; never resolves otherwise
async fn kill_marker_seen(
    marker: &Option<KillMarker>,
    stdout: &OutputBuffer,
    stderr: &OutputBuffer,
) -> bool {
    match marker {
        Some(marker) => {
            if marker_seen(stdout, stderr, &marker.pattern, marker.streams).await {
                return true;
            }
            std::future::pending().await
        }
        None => std::future::pending().await,
    }
}

/// Waits for `pattern` in the selected streams; false once they all closed
async fn marker_seen(
    stdout: &OutputBuffer,
    stderr: &OutputBuffer,
    pattern: &[u8],
    streams: MarkerStreams,
) -> bool {
    match streams {
        MarkerStreams::Stdout => stdout.wait_for(pattern).await,
        MarkerStreams::Both => {
            tokio::select! {
                true = stdout.wait_for(pattern) => true,
                true = stderr.wait_for(pattern) => true,
                else => false,
            }
        }
    }
}

async fn feed_stdin(
    mut stdin: ChildStdin,
    payload: StdinPayload,
    stdout: Arc<OutputBuffer>,
    stderr: Arc<OutputBuffer>,
) {
    if let Some(ref marker) = payload.send_after {
        if !marker_seen(&stdout, &stderr, marker, MarkerStreams::Both).await {
            debug!("Output closed before send marker, payload not sent");
            return;
        }
    }
    if let Err(e) = stdin.write_all(&payload.data).await {
        warn!("Failed to write payload to stdin: {}", e);
        return;
    }
    if let Err(e) = stdin.shutdown().await {
        debug!("Failed to close stdin: {}", e);
    }
    debug!("Wrote {} payload bytes to stdin", payload.data.len());
}

/// Sends a signal to the process group led by `pid`
///
/// A group that no longer exists counts as success.
pub fn signal_group(pid: Pid, signal: Signal) -> Result<()> {
    debug!("Sending signal {:?} to process group {}", signal, pid);
    match kill(Pid::from_raw(-pid.as_raw()), signal) {
        Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
