//! External process execution with captured output
//!
//! [`ProcessRunner`] launches one executable at a time, drains both
//! standard streams while the process runs and reports the exit code
//! together with everything the process printed. It can block the
//! calling thread ([`ProcessRunner::execute_blocking`]) or run on a
//! dedicated worker thread and report through a callback
//! ([`ProcessRunner::execute_async`]).
//!
//! Nothing here retries, times out or cancels. A hung tool hangs its caller.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::{Result, SigningError};

/// Exit code reported when the process could not be started at all.
pub const LAUNCH_FAILED_EXIT_CODE: i32 = -1;

/// Exit code reported when the process ended without one, e.g. killed by
/// a signal. The error text says how it ended.
pub const TERMINATED_EXIT_CODE: i32 = -2;

/// Which standard stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Receives captured lines as they arrive.
///
/// The runner accumulates every line into its [`ProcessResult`] regardless;
/// a sink only observes.
pub trait LineSink: Send + Sync {
    /// Handle one line without its terminator
    fn line(&self, stream: Stream, line: &str);
}

/// Sink that forwards lines to tracing
#[derive(Debug, Default)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn line(&self, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => debug!(target: "signet::tool", "{}", line),
            Stream::Stderr => warn!(target: "signet::tool", "{}", line),
        }
    }
}

/// Description of one external process call
#[derive(Debug, Clone, Default)]
pub struct ProcessInvocation {
    program: PathBuf,
    arguments: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ProcessInvocation {
    /// Create an invocation of `program` with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Set the argument string, passed to the process as-is
    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Override one environment variable.
    ///
    /// Keys compare case-insensitively on Windows, so a later override of
    /// `path` replaces an earlier `PATH`.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(existing, _)| !env_key_eq(existing, &key));
        self.env.push((key, value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Environment overrides in insertion order
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Full command line for display
    pub fn command_line(&self) -> String {
        if self.arguments.is_empty() {
            self.program.display().to_string()
        } else {
            format!("{} {}", self.program.display(), self.arguments)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            return Err(SigningError::Configuration(
                "No executable to start".to_string(),
            ));
        }
        Ok(())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);

        #[cfg(windows)]
        {
            if !self.arguments.is_empty() {
                command.raw_arg(&self.arguments);
            }
        }
        #[cfg(not(windows))]
        {
            command.args(split_arguments(&self.arguments));
        }

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn env_key_eq(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// Split an argument string into tokens, honouring double quotes.
///
/// Quotes group whitespace into a single token and are removed; there is
/// no escape character. This mirrors how the signing tool's own command
/// line is tokenized on Windows for the grammar this crate produces.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in arguments.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }

    tokens
}

/// Outcome of one process run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    exit_code: i32,
    output: String,
    error: String,
}

impl ProcessResult {
    pub fn new(exit_code: i32, output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
            error: error.into(),
        }
    }

    /// Result delivered when the process never started
    pub fn launch_failed(message: impl Into<String>) -> Self {
        Self::new(LAUNCH_FAILED_EXIT_CODE, String::new(), message)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Captured standard output, one line per captured line
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Captured standard error, one line per captured line
    pub fn error(&self) -> &str {
        &self.error
    }

    /// Exit code zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a configured [`ProcessInvocation`], one at a time.
pub struct ProcessRunner {
    invocation: ProcessInvocation,
    sink: Arc<dyn LineSink>,
    processing: Arc<AtomicBool>,
}

impl ProcessRunner {
    /// Create a runner with the default tracing sink
    pub fn new(invocation: ProcessInvocation) -> Self {
        Self::with_sink(invocation, Arc::new(TracingSink))
    }

    /// Create a runner that reports lines to `sink`
    pub fn with_sink(invocation: ProcessInvocation, sink: Arc<dyn LineSink>) -> Self {
        Self {
            invocation,
            sink,
            processing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the invocation.
    ///
    /// Only checked when an execution starts, so an empty program is
    /// reported by `execute_*`, not here.
    pub fn configure(
        &mut self,
        program: impl Into<PathBuf>,
        arguments: impl Into<String>,
        working_dir: Option<PathBuf>,
        env: impl IntoIterator<Item = (String, String)>,
    ) {
        let mut invocation = ProcessInvocation::new(program).with_arguments(arguments);
        if let Some(dir) = working_dir {
            invocation = invocation.with_working_dir(dir);
        }
        for (key, value) in env {
            invocation = invocation.with_env(key, value);
        }
        self.invocation = invocation;
    }

    pub fn invocation(&self) -> &ProcessInvocation {
        &self.invocation
    }

    /// Whether an execution is in flight
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Run the process and block until it exits.
    ///
    /// Must not be called from within an async runtime.
    #[instrument(skip(self), fields(program = %self.invocation.program.display()))]
    pub fn execute_blocking(&self) -> Result<ProcessResult> {
        self.invocation.validate()?;
        let _busy = BusyGuard::acquire(&self.processing)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(run(&self.invocation, self.sink.as_ref()))
    }

    /// Run the process on a worker thread and return immediately.
    ///
    /// `on_finished` is called exactly once on that worker thread, after the
    /// runner is free again. A launch failure is reported with
    /// [`LAUNCH_FAILED_EXIT_CODE`], empty output and the OS error as error
    /// text. Redispatching to a UI thread is the caller's business.
    pub fn execute_async<F>(&self, on_finished: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce(ProcessResult) + Send + 'static,
    {
        self.invocation.validate()?;
        let busy = BusyGuard::acquire(&self.processing)?;

        let invocation = self.invocation.clone();
        let sink = Arc::clone(&self.sink);

        Ok(std::thread::spawn(move || {
            let result = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(SigningError::from)
                .and_then(|runtime| runtime.block_on(run(&invocation, sink.as_ref())));

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "process did not run");
                    ProcessResult::launch_failed(e.to_string())
                }
            };

            drop(busy);
            on_finished(result);
        }))
    }
}

/// Holds the in-flight flag; clears it on every exit path.
struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SigningError::AlreadyRunning)?;
        Ok(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

async fn run(invocation: &ProcessInvocation, sink: &dyn LineSink) -> Result<ProcessResult> {
    debug!(command = %invocation.command_line(), "starting process");

    let mut child = invocation
        .command()
        .spawn()
        .map_err(|source| SigningError::Launch {
            program: invocation.program.clone(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Both pipes are drained concurrently with the wait so a chatty tool
    // can never block on a full pipe buffer.
    let (output, error, status) = tokio::join!(
        drain(stdout, Stream::Stdout, sink),
        drain(stderr, Stream::Stderr, sink),
        child.wait(),
    );

    // `child` drops here, closing every handle even when the wait failed.
    let status = status?;
    let (exit_code, error) = match status.code() {
        Some(code) => (code, error),
        None => {
            let message = termination_message(&status);
            warn!(%message, "process ended without an exit code");
            (TERMINATED_EXIT_CODE, format!("{}{}\n", error, message))
        }
    };
    debug!(exit_code, "process exited");

    Ok(ProcessResult::new(exit_code, output, error))
}

#[cfg(unix)]
fn termination_message(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signal) => format!("Process terminated by signal {}", signal),
        None => "Process terminated without an exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn termination_message(_status: &std::process::ExitStatus) -> String {
    "Process terminated without an exit code".to_string()
}

async fn drain<R>(pipe: Option<R>, stream: Stream, sink: &dyn LineSink) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return String::new();
    };

    let mut reader = BufReader::new(pipe);
    let mut captured = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // Tools may print in a legacy code page; keep what we can.
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                sink.line(stream, line);
                captured.push_str(line);
                captured.push('\n');
            }
            Err(e) => {
                warn!(?stream, error = %e, "stopped reading process output");
                break;
            }
        }
    }

    captured
}
