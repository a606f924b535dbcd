//! Command execution.
//!
//! Commands run through `sh -c` with stdin closed and stderr merged into
//! stdout. A reader task drains the pipe while the runner waits on the
//! process; only the most recent lines are kept in memory. On timeout the
//! whole process tree is killed and [`ABNORMAL_EXIT`] is reported.

use crate::process::{kill_tree, TreeGuard};
use async_trait::async_trait;
use benchman_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;

/// Exit code reported for timeouts, signals, cancellations and spawn failures.
pub const ABNORMAL_EXIT: i32 = -1;

/// Lines kept in memory per command unless configured otherwise.
pub const DEFAULT_OUTPUT_LINES: usize = 5000;

const READ_CHUNK: usize = 1024;
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A command to execute.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandSpec {
    /// Shell command line
    pub command: String,

    /// Environment overlay on top of the inherited environment
    pub env: Vec<(String, String)>,

    /// Working directory
    pub cwd: Option<PathBuf>,

    /// Wall-clock limit
    pub timeout: Option<Duration>,

    /// Do not echo output lines to the log
    #[serde(default)]
    pub silent: bool,
}

impl CommandSpec {
    /// Spec for `command`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Builder: add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Builder: set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Builder: set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder: suppress per-line logging.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Header of a log artifact: command, blank line, env lines, blank line.
    fn log_header(&self) -> String {
        let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}\n\n{}\n\n", self.command, env.join("\n"))
    }
}

/// Result of a finished (or killed) command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOutcome {
    /// Most recent output lines joined by `\n`
    pub output: String,

    /// Process exit code, or [`ABNORMAL_EXIT`]
    pub exit_code: i32,

    /// Wall-clock duration
    pub duration: Duration,

    /// Whether the timeout fired
    pub timed_out: bool,
}

impl CommandOutcome {
    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `n` output lines.
    pub fn tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }
}

/// Runs commands.
///
/// Everything above this layer calls through the trait so tests can count or
/// script invocations.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command and capture its output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome>;

    /// Run a command and persist a log artifact at `log_path`.
    ///
    /// The artifact is written even if the command cannot be started or the
    /// call is cancelled.
    async fn run_and_log(&self, spec: &CommandSpec, log_path: &Path) -> Result<CommandOutcome>;
}

/// Local process runner.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    output_lines: usize,
    silent: bool,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            output_lines: DEFAULT_OUTPUT_LINES,
            silent: false,
        }
    }
}

impl CommandRunner {
    /// Runner keeping [`DEFAULT_OUTPUT_LINES`] lines.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the ring buffer size.
    pub fn with_output_lines(mut self, lines: usize) -> Self {
        self.output_lines = lines.max(1);
        self
    }

    /// Builder: never echo output lines.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    async fn execute(&self, spec: &CommandSpec, log: Option<fs::File>) -> Result<CommandOutcome> {
        let start = Instant::now();
        tracing::info!(command = %spec.command, "running command");

        // `exec 2>&1` on its own line merges stderr before the rest of the
        // script is parsed, so even syntax errors land in the captured output.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec 2>&1\n{}", spec.command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let mut guard = TreeGuard::new(pid);

        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(self.output_lines.min(1024))));
        let mut reader = match child.stdout.take() {
            Some(stdout) => {
                let sink = LineSink {
                    buffer: buffer.clone(),
                    capacity: self.output_lines,
                    silent: self.silent || spec.silent,
                    log,
                };
                Some(tokio::spawn(drain(stdout, sink)))
            }
            None => None,
        };

        let waited = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };
        let (exit_code, timed_out) = match waited {
            Some(Ok(status)) => {
                guard.disarm();
                (status.code().unwrap_or(ABNORMAL_EXIT), false)
            }
            Some(Err(e)) => {
                tracing::warn!(command = %spec.command, error = %e, "wait failed, killing process tree");
                guard.kill();
                (ABNORMAL_EXIT, false)
            }
            None => {
                tracing::warn!(
                    command = %spec.command,
                    timeout_secs = spec.timeout.map(|t| t.as_secs_f64()).unwrap_or_default(),
                    "command timed out, killing process tree"
                );
                guard.kill();
                let _ = child.wait().await;
                (ABNORMAL_EXIT, true)
            }
        };

        if let Some(handle) = reader.as_mut() {
            match tokio::time::timeout(READER_JOIN_TIMEOUT, &mut *handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "output reader failed"),
                Err(_) => {
                    // Output pipe still held open by a detached grandchild.
                    tracing::warn!(command = %spec.command, "output reader did not finish, detaching");
                    handle.abort();
                    if let Some(pid) = pid {
                        kill_tree(pid);
                    }
                }
            }
        }

        let output = buffer.lock().await.iter().cloned().collect::<Vec<_>>().join("\n");
        let duration = start.elapsed();
        tracing::debug!(command = %spec.command, exit_code, secs = duration.as_secs_f64(), "command finished");
        Ok(CommandOutcome {
            output,
            exit_code,
            duration,
            timed_out,
        })
    }
}

#[async_trait]
impl CommandExecutor for CommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        self.execute(spec, None).await
    }

    async fn run_and_log(&self, spec: &CommandSpec, log_path: &Path) -> Result<CommandOutcome> {
        let start = Instant::now();
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(log_path).await?;
        file.write_all(spec.log_header().as_bytes()).await?;
        file.flush().await?;
        let _footer = ExecutionTimeFooter {
            path: log_path.to_path_buf(),
            start,
        };

        match self.execute(spec, Some(file)).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(command = %spec.command, error = %e, "command could not be started");
                let message = format!("{e}\n");
                if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(log_path) {
                    let _ = f.write_all(message.as_bytes());
                }
                Ok(CommandOutcome {
                    output: e.to_string(),
                    exit_code: ABNORMAL_EXIT,
                    duration: start.elapsed(),
                    timed_out: false,
                })
            }
        }
    }
}

/// Appends the execution time to a log artifact on drop.
struct ExecutionTimeFooter {
    path: PathBuf,
    start: Instant,
}

impl Drop for ExecutionTimeFooter {
    fn drop(&mut self) {
        let secs = self.start.elapsed().as_secs_f64();
        let appended = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .and_then(|mut f| write!(f, "\nExecution time: {secs:.3} seconds\n"));
        if let Err(e) = appended {
            tracing::warn!(log = %self.path.display(), error = %e, "failed to finish log artifact");
        }
    }
}

/// Destination of decoded output lines.
struct LineSink {
    buffer: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    silent: bool,
    log: Option<fs::File>,
}

impl LineSink {
    async fn push(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        if line.is_empty() {
            return;
        }
        if !self.silent {
            tracing::info!(target: "benchman::cmd", "{}", line);
        }
        if let Some(file) = self.log.as_mut() {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!(error = %e, "failed to write log artifact, continuing without it");
                self.log = None;
            }
        }
        let mut buffer = self.buffer.lock().await;
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(line.into_owned());
    }

    async fn finish(&mut self) {
        if let Some(file) = self.log.as_mut() {
            let _ = file.flush().await;
        }
    }
}

/// Read `reader` to EOF in fixed-size chunks, splitting on `\n` and `\r`.
async fn drain<R: AsyncRead + Unpin>(mut reader: R, mut sink: LineSink) {
    let mut chunk = [0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "output pipe closed");
                break;
            }
        };
        pending.extend_from_slice(&chunk[..n]);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            sink.push(&line[..line.len() - 1]).await;
        }
    }
    if !pending.is_empty() {
        sink.push(&pending).await;
    }
    sink.finish().await;
}
