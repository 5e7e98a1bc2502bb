//! Process execution for builds and test runs.
//!
//! `ProcessRunner` is the seam through which every external program (compiler, `nm`,
//! `objcopy`, the test executable, an MPI launcher) is started. `CommandRunner` shells out
//! with a timeout and a cancellation token; `MockRunner` answers from a closure so the
//! search can be exercised without a toolchain.

use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::build::mock::BuildManifest;
use crate::{BisectError, BisectResult};

/// Shared flag that asks long-running work to stop early.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A program invocation, optionally wrapped in a launcher such as `mpirun -n 4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub launcher: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Invocation { program: program.into(), args: Vec::new(), cwd: None, launcher: Vec::new() }
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_launcher(mut self, launcher: Vec<String>) -> Self {
        self.launcher = launcher;
        self
    }

    /// The argv actually executed, launcher first.
    pub fn argv(&self) -> Vec<String> {
        self.launcher
            .iter()
            .cloned()
            .chain(std::iter::once(self.program.to_string_lossy().to_string()))
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn command_line(&self) -> String {
        let argv = self.argv();
        shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_else(|_| argv.join(" "))
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled,
    TimedOut,
    Cancelled,
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Exited(code) => write!(f, "exit code {code}"),
            ExitKind::Signaled => write!(f, "killed by signal"),
            ExitKind::TimedOut => write!(f, "timed out"),
            ExitKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Captured result of one process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit: ExitKind,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u128,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit == ExitKind::Exited(0)
    }

    /// Exit description plus the tail of stderr, for failure reports.
    pub fn failure_summary(&self) -> String {
        let tail: Vec<&str> = self.stderr.lines().rev().take(5).collect();
        if tail.is_empty() {
            self.exit.to_string()
        } else {
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            format!("{}: {}", self.exit, tail.join(" | "))
        }
    }
}

/// Runs external programs.
pub trait ProcessRunner: Send + Sync {
    /// Run `invocation` to completion, killing it after `timeout` (zero = no limit) or
    /// once `cancel` fires.
    ///
    /// Returns `Err` only when the process could not be started at all.
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> BisectResult<ProcessOutput>;
}

/// `ProcessRunner` backed by `std::process::Command`.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    poll_interval: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        CommandRunner { poll_interval: Duration::from_millis(20) }
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read_capture(file: &mut std::fs::File) -> String {
    let mut bytes = Vec::new();
    if file.seek(SeekFrom::Start(0)).is_ok() {
        let _ = file.read_to_end(&mut bytes);
    }
    String::from_utf8_lossy(&bytes).to_string()
}

impl ProcessRunner for CommandRunner {
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> BisectResult<ProcessOutput> {
        let argv = invocation.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(BisectError::Message("empty invocation".into()));
        };

        // Captures go to anonymous files so a chatty child can never block on a full pipe.
        let mut stdout_file =
            tempfile::tempfile().map_err(|e| BisectError::io("failed to create capture file", e))?;
        let mut stderr_file =
            tempfile::tempfile().map_err(|e| BisectError::io("failed to create capture file", e))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(
                stdout_file
                    .try_clone()
                    .map_err(|e| BisectError::io("failed to clone capture file", e))?,
            )
            .stderr(
                stderr_file
                    .try_clone()
                    .map_err(|e| BisectError::io("failed to clone capture file", e))?,
            );
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        debug!(command = %invocation.command_line(), "spawning");
        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| BisectError::Runtime(format!("failed to spawn {program}: {e}")))?;

        let exit = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| BisectError::Runtime(format!("failed to wait for {program}: {e}")))?
            {
                break match status.code() {
                    Some(code) => ExitKind::Exited(code),
                    None => ExitKind::Signaled,
                };
            }

            if !timeout.is_zero() && start.elapsed() >= timeout {
                warn!(command = %invocation.command_line(), ?timeout, "killing timed out process");
                let _ = child.kill();
                let _ = child.wait();
                break ExitKind::TimedOut;
            }

            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                break ExitKind::Cancelled;
            }

            std::thread::sleep(self.poll_interval);
        };

        Ok(ProcessOutput {
            exit,
            stdout: read_capture(&mut stdout_file),
            stderr: read_capture(&mut stderr_file),
            elapsed_ms: start.elapsed().as_millis(),
        })
    }
}

/// Scripted reply of a `MockRunner`.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Clean exit with the given stdout
    Output(String),
    /// Non-zero exit
    Exit { code: i32, stderr: String },
    /// Never finishes; reported as timed out
    Hang,
}

type MockHandler = dyn Fn(&Invocation) -> MockResponse + Send + Sync;

/// Process runner for tests that answers from a closure instead of spawning.
pub struct MockRunner {
    handler: Box<MockHandler>,
    calls: AtomicUsize,
}

impl MockRunner {
    pub fn new(handler: impl Fn(&Invocation) -> MockResponse + Send + Sync + 'static) -> Self {
        MockRunner { handler: Box::new(handler), calls: AtomicUsize::new(0) }
    }

    /// Answer from the `BuildManifest` that `MockBuildPipeline` writes next to the executable.
    pub fn from_manifest(
        handler: impl Fn(&BuildManifest, &Invocation) -> MockResponse + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |invocation| {
            let dir = invocation.program.parent().unwrap_or(Path::new("."));
            match BuildManifest::load(dir) {
                Ok(manifest) => handler(&manifest, invocation),
                Err(e) => MockResponse::Exit { code: 127, stderr: e.to_string() },
            }
        })
    }

    /// Number of invocations seen so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProcessRunner for MockRunner {
    fn run(
        &self,
        invocation: &Invocation,
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> BisectResult<ProcessOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Ok(ProcessOutput {
                exit: ExitKind::Cancelled,
                stdout: String::new(),
                stderr: String::new(),
                elapsed_ms: 0,
            });
        }
        let (exit, stdout, stderr) = match (self.handler)(invocation) {
            MockResponse::Output(stdout) => (ExitKind::Exited(0), stdout, String::new()),
            MockResponse::Exit { code, stderr } => (ExitKind::Exited(code), String::new(), stderr),
            MockResponse::Hang => (ExitKind::TimedOut, String::new(), String::new()),
        };
        Ok(ProcessOutput { exit, stdout, stderr, elapsed_ms: 1 })
    }
}
