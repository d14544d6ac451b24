//! External command execution.
//!
//! Two facilities share the spawn plumbing:
//! - [`SystemCommandExecutor`]: bounded one-shot execution with timeout,
//!   cooperative cancellation, and process-group kill.
//! - [`MonitorProcess`]: a long-running child whose stdout is drained line
//!   by line into a capped buffer (the persistent watcher sessions).
//!
//! Children are spawned into their own process group so a timeout or
//! cancel can take down the whole tree, not just the direct child.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a command run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    NonZeroExit,
    TimedOut,
    StartFailed,
    Cancelled,
}

/// Why a command never produced an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFailureKind {
    None,
    ToolNotFound,
    StartFailure,
}

/// A single command invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub program: String,
    pub arguments: Vec<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_output_chars: usize,
}

impl CommandRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(200),
            max_output_chars: 262_144,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }
}

/// Shared request tuning from the diagnostics settings.
#[derive(Debug, Clone, Copy)]
pub struct CommandTuning {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_output_chars: usize,
}

impl CommandTuning {
    pub fn apply(&self, request: CommandRequest) -> CommandRequest {
        request
            .timeout(self.timeout)
            .poll_interval(self.poll_interval)
            .max_output_chars(self.max_output_chars)
    }
}

/// The captured result of a command run.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub outcome: CommandOutcome,
    pub failure_kind: CommandFailureKind,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.outcome == CommandOutcome::Success
    }

    fn start_failed(kind: CommandFailureKind, elapsed: Duration) -> Self {
        Self {
            outcome: CommandOutcome::StartFailed,
            failure_kind: kind,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed,
        }
    }
}

/// Command execution seam.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: CommandRequest, cancel: &CancellationToken) -> CommandResult;
}

/// Kill the process group rooted at `pid`, best effort.
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // Negative pid addresses the process group created at spawn via
        // process_group(0).
        // SAFETY: plain POSIX kill(2) on a pgid we created ourselves.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

fn configure(command: &mut Command) {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
}

/// Drain one stream line by line into a char-capped buffer. Excess output
/// is read and discarded so the child never blocks on a full pipe.
fn spawn_capped_drain<R>(
    stream: R,
    max_chars: usize,
) -> tokio::task::JoinHandle<(String, bool)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = String::new();
        let mut truncated = false;
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if captured.len() >= max_chars {
                truncated = true;
                continue;
            }
            let remaining = max_chars - captured.len();
            if line.len() + 1 > remaining {
                captured.extend(line.chars().take(remaining));
                truncated = true;
            } else {
                captured.push_str(&line);
                captured.push('\n');
            }
        }
        (captured, truncated)
    })
}

/// Tokio-backed process executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandExecutor;

impl SystemCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn execute(&self, request: CommandRequest, cancel: &CancellationToken) -> CommandResult {
        debug_assert!(!request.timeout.is_zero(), "timeout must be positive");
        debug_assert!(!request.poll_interval.is_zero(), "poll interval must be positive");
        debug_assert!(request.max_output_chars > 0, "output cap must be positive");

        let start = Instant::now();
        let mut command = Command::new(&request.program);
        command.args(&request.arguments);
        configure(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let kind = if err.kind() == std::io::ErrorKind::NotFound {
                    CommandFailureKind::ToolNotFound
                } else {
                    CommandFailureKind::StartFailure
                };
                debug!(program = %request.program, error = %err, "spawn failed");
                return CommandResult::start_failed(kind, start.elapsed());
            }
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|s| spawn_capped_drain(s, request.max_output_chars));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| spawn_capped_drain(s, request.max_output_chars));

        let pid = child.id();
        let outcome;
        let mut exit_code = None;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_code = status.code();
                    outcome = if status.success() {
                        CommandOutcome::Success
                    } else {
                        CommandOutcome::NonZeroExit
                    };
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(program = %request.program, error = %err, "wait failed");
                    kill_process_group(pid);
                    let _ = child.kill().await;
                    outcome = CommandOutcome::StartFailed;
                    break;
                }
            }

            let remaining = request.timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() || cancel.is_cancelled() {
                // One last immediate probe before declaring the run dead;
                // the child may have exited between checks.
                if let Ok(Some(status)) = child.try_wait() {
                    exit_code = status.code();
                    outcome = if status.success() {
                        CommandOutcome::Success
                    } else {
                        CommandOutcome::NonZeroExit
                    };
                    break;
                }
                kill_process_group(pid);
                let _ = child.kill().await;
                outcome = if cancel.is_cancelled() {
                    CommandOutcome::Cancelled
                } else {
                    CommandOutcome::TimedOut
                };
                break;
            }

            let wait = request.poll_interval.min(remaining);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {}
            }
        }

        // Capture-task failures never fail the command itself.
        let (stdout, stdout_truncated) = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => (String::new(), false),
        };
        let (stderr, stderr_truncated) = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => (String::new(), false),
        };

        let failure_kind = if outcome == CommandOutcome::StartFailed {
            CommandFailureKind::StartFailure
        } else {
            CommandFailureKind::None
        };

        CommandResult {
            outcome,
            failure_kind,
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            elapsed: start.elapsed(),
        }
    }
}

/// Shared line buffer with a hard cap; oldest lines drop first.
#[derive(Debug, Default)]
struct LineBuffer {
    lines: VecDeque<String>,
    dropped: u64,
    cap: usize,
}

impl LineBuffer {
    fn push(&mut self, line: String) {
        if self.lines.len() >= self.cap {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }
}

/// A persistent child process with line-oriented stdout.
///
/// Used for `inotifywait -m` monitor sessions: the session stays up across
/// polls and each poll drains whatever lines arrived since the last one.
#[derive(Debug)]
pub struct MonitorProcess {
    child: Child,
    buffer: Arc<Mutex<LineBuffer>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    spawned_at: Instant,
}

/// Lines a monitor buffers before dropping the oldest.
const MONITOR_LINE_CAP: usize = 8192;
/// Stderr lines kept for failure diagnostics.
const MONITOR_STDERR_TAIL: usize = 16;

impl MonitorProcess {
    pub fn spawn(program: &str, arguments: &[String]) -> std::io::Result<Self> {
        let mut command = Command::new(program);
        command.args(arguments);
        configure(&mut command);
        let mut child = command.spawn()?;

        let buffer = Arc::new(Mutex::new(LineBuffer {
            cap: MONITOR_LINE_CAP,
            ..LineBuffer::default()
        }));
        if let Some(stdout) = child.stdout.take() {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    buffer
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push(line);
                }
            });
        }

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    if tail.len() >= MONITOR_STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        Ok(Self {
            child,
            buffer,
            stderr_tail,
            spawned_at: Instant::now(),
        })
    }

    /// Take every buffered stdout line plus the count of lines dropped by
    /// the cap since the previous drain.
    pub fn drain_lines(&self) -> (Vec<String>, u64) {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let lines = buffer.lines.drain(..).collect();
        let dropped = std::mem::take(&mut buffer.dropped);
        (lines, dropped)
    }

    /// Exit status when the child has terminated.
    pub fn exit_status(&mut self) -> Option<std::process::ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub fn is_running(&mut self) -> bool {
        self.exit_status().is_none()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Kill the session and its subtree, best effort.
    pub async fn dispose(mut self) {
        kill_process_group(self.child.id());
        let _ = self.child.kill().await;
    }
}
