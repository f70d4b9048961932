//! Bounded process execution.
//!
//! A command runs on its own task with piped output and a wall-clock
//! deadline. Whichever of "process finished" or "deadline elapsed" happens
//! first decides the result; on the deadline path the child is killed and the
//! output captured so far is reported.
//!
//! Output is buffered in memory without a size cap.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exit code reported when the process gave us no meaningful one.
pub const NO_EXIT_CODE: i32 = -1;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start command: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed waiting for command: {0}")]
    Wait(#[source] io::Error),
    #[error("exit status {code}")]
    Exited { code: i32 },
    #[error("command terminated abnormally: {status}")]
    Abnormal { status: ExitStatus },
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("executor task failed: {0}")]
    Aborted(String),
}

impl ExecError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecError::Exited { code } => *code,
            _ => NO_EXIT_CODE,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::TimedOut(_))
    }
}

/// Outcome record of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub command: String,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecutionResult {
    fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// One-line reason for a failed run: first line of stderr, then the
    /// error text, then a generic fallback.
    pub fn failure_message(&self, err: Option<&ExecError>) -> String {
        if !self.stderr.is_empty() {
            return self.stderr.lines().next().unwrap_or_default().to_string();
        }
        match err {
            Some(err) => err.to_string(),
            None => "unknown error".to_string(),
        }
    }
}

/// Run `command` with `args`, killing it once `timeout` elapses.
///
/// Ordinary failures are never returned as `Err`; they are encoded in the
/// result, with the accompanying error telling success, non-zero exit,
/// timeout and launch failure apart.
///
/// The work happens on a spawned task so the deadline keeps running even if
/// the caller's future is dropped.
pub async fn run(
    command: &str,
    args: &[String],
    timeout: Duration,
) -> (ExecutionResult, Option<ExecError>) {
    let started = Instant::now();
    let task = tokio::spawn(execute(command.to_string(), args.to_vec(), timeout));

    match task.await {
        Ok(outcome) => outcome,
        Err(join_err) => {
            let mut result = ExecutionResult::new(command.to_string(), args.to_vec());
            result.exit_code = NO_EXIT_CODE;
            result.duration = started.elapsed();
            (result, Some(ExecError::Aborted(join_err.to_string())))
        }
    }
}

async fn execute(
    command: String,
    args: Vec<String>,
    timeout: Duration,
) -> (ExecutionResult, Option<ExecError>) {
    let started = Instant::now();
    let mut result = ExecutionResult::new(command, args);

    debug!(command = %result.command, args = ?result.args, timeout = ?timeout, "spawning command");

    let spawned = Command::new(&result.command)
        .args(&result.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            result.exit_code = NO_EXIT_CODE;
            result.duration = started.elapsed();
            return (result, Some(ExecError::Spawn(e)));
        }
    };

    let mut stdout = OutputCapture::spawn(child.stdout.take());
    let mut stderr = OutputCapture::spawn(child.stderr.take());

    let finished = tokio::select! {
        status = wait_for_exit(&mut child, &mut stdout, &mut stderr) => Some(status),
        _ = tokio::time::sleep(timeout) => None,
    };

    let error = match finished {
        Some(Ok(status)) => classify(status, &mut result),
        Some(Err(e)) => {
            result.exit_code = NO_EXIT_CODE;
            Some(ExecError::Wait(e))
        }
        None => {
            // Best effort: the request completes whether or not the kill lands.
            if let Err(e) = child.start_kill() {
                warn!(command = %result.command, error = %e, "failed to kill timed out command");
            }
            result.timed_out = true;
            result.exit_code = NO_EXIT_CODE;
            Some(ExecError::TimedOut(timeout))
        }
    };

    result.duration = started.elapsed();
    result.stdout = stdout.text();
    result.stderr = stderr.text();

    (result, error)
}

async fn wait_for_exit(
    child: &mut Child,
    stdout: &mut OutputCapture,
    stderr: &mut OutputCapture,
) -> io::Result<ExitStatus> {
    let status = child.wait().await?;
    stdout.drained().await;
    stderr.drained().await;
    Ok(status)
}

fn classify(status: ExitStatus, result: &mut ExecutionResult) -> Option<ExecError> {
    match status.code() {
        Some(0) => {
            result.exit_code = 0;
            None
        }
        Some(code) => {
            result.exit_code = code;
            Some(ExecError::Exited { code })
        }
        None => {
            result.exit_code = NO_EXIT_CODE;
            Some(ExecError::Abnormal { status })
        }
    }
}

/// Drains one child stream into a shared buffer so a partial read survives
/// a timeout.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn spawn<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let reader = stream.map(|mut stream| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => lock(&buffer).extend_from_slice(&chunk[..n]),
                        Err(e) => {
                            debug!(error = %e, "stopped reading command output");
                            break;
                        }
                    }
                }
            })
        });
        Self { buffer, reader }
    }

    async fn drained(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            let _ = reader.await;
            self.reader = None;
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buffer)).into_owned()
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn lock(buffer: &Mutex<Vec<u8>>) -> std::sync::MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
