//! Runs the external extraction worker against a target and captures its result.
//!
//! Every call allocates its own temp output file in the work directory; the
//! file is removed before [`ProcessRunner::run`] returns, whatever the outcome.

use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use tempfile::TempPath;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::models::OutputFormat;

/// Per-stream capture ceiling for worker stdout/stderr (10 MiB).
const MAX_STREAM_BYTES: u64 = 10 * 1024 * 1024;

/// How long to keep draining pipes after the child has been killed.
const STREAM_DRAIN_GRACE: Duration = Duration::from_secs(2);

const REDACTED_OUTPUT_PATH: &str = "<output>";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("worker `{program}` could not be started: {source}")]
    WorkerNotFound {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// Displays only the error kind; the underlying error names the work dir.
    #[error("failed to allocate temp output file ({})", .0.kind())]
    TempFile(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
    OutputMissing,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub status: RunStatus,
    /// `None` when the worker was killed without a status (timeout or a failed
    /// wait), `-1` when it died by signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    output: Option<Vec<u8>>,
}

impl ProcessOutcome {
    /// Result file contents. Only present for [`RunStatus::Succeeded`].
    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }

    pub fn into_output(self) -> Option<Vec<u8>> {
        self.output
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    leading_args: Vec<String>,
    work_dir: PathBuf,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>, work_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            leading_args,
            work_dir,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub async fn run(
        &self,
        target: &str,
        format: OutputFormat,
        max_records: u32,
        timeout: Duration,
    ) -> Result<ProcessOutcome, RunnerError> {
        let output_path = tempfile::Builder::new()
            .prefix("extract-")
            .suffix(&format!(".{}", format.as_str()))
            .tempfile_in(&self.work_dir)
            .map_err(|err| {
                warn!("Failed to allocate worker output file: {err}");
                RunnerError::TempFile(err)
            })?
            .into_temp_path();

        let result = self
            .run_with_output(&output_path, target, format, max_records, timeout)
            .await;

        discard_output(output_path);
        result
    }

    async fn run_with_output(
        &self,
        output_path: &Path,
        target: &str,
        format: OutputFormat,
        max_records: u32,
        timeout: Duration,
    ) -> Result<ProcessOutcome, RunnerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(worker_args(target, output_path, format, max_records))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| RunnerError::WorkerNotFound {
            program: self.program.clone(),
            source,
        })?;
        debug!(program = %self.program, pid = ?child.id(), "Worker spawned");

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let waited = classify_wait(tokio::time::timeout(timeout, child.wait()).await.ok());
        if !matches!(waited, Waited::Exited(_)) {
            terminate(&mut child).await;
        }
        let elapsed = start.elapsed();

        let redact = |text: String| redact_path(text, output_path);
        let stdout = redact(drain(stdout_task).await);
        let mut stderr = redact(drain(stderr_task).await);

        let exit_status = match waited {
            Waited::Exited(status) => status,
            Waited::TimedOut => {
                return Ok(ProcessOutcome {
                    status: RunStatus::TimedOut,
                    exit_code: None,
                    stdout,
                    stderr,
                    elapsed,
                    output: None,
                });
            }
            Waited::WaitFailed(reason) => {
                warn!(program = %self.program, "Failed waiting on worker: {reason}");
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("failed waiting on worker: {reason}"));
                return Ok(ProcessOutcome {
                    status: RunStatus::Failed,
                    exit_code: None,
                    stdout,
                    stderr,
                    elapsed,
                    output: None,
                });
            }
        };

        let exit_code = exit_status.code().unwrap_or(-1);
        if !exit_status.success() {
            return Ok(ProcessOutcome {
                status: RunStatus::Failed,
                exit_code: Some(exit_code),
                stdout,
                stderr,
                elapsed,
                output: None,
            });
        }

        let (status, output) = match tokio::fs::read(output_path).await {
            Ok(bytes) if !bytes.is_empty() => (RunStatus::Succeeded, Some(bytes)),
            Ok(_) => (RunStatus::OutputMissing, None),
            Err(err) => {
                debug!("Worker output unreadable: {err}");
                (RunStatus::OutputMissing, None)
            }
        };

        Ok(ProcessOutcome {
            status,
            exit_code: Some(exit_code),
            stdout,
            stderr,
            elapsed,
            output,
        })
    }
}

fn worker_args(
    target: &str,
    output_path: &Path,
    format: OutputFormat,
    max_records: u32,
) -> Vec<std::ffi::OsString> {
    vec![
        "-i".into(),
        target.into(),
        "-o".into(),
        output_path.as_os_str().to_owned(),
        "-f".into(),
        format.as_str().into(),
        "--parser.max-records".into(),
        max_records.to_string().into(),
    ]
}

#[derive(Debug)]
enum Waited {
    Exited(ExitStatus),
    WaitFailed(String),
    TimedOut,
}

/// `None` means the deadline passed before the worker exited.
fn classify_wait(result: Option<io::Result<ExitStatus>>) -> Waited {
    match result {
        Some(Ok(status)) => Waited::Exited(status),
        Some(Err(err)) => Waited::WaitFailed(err.to_string()),
        None => Waited::TimedOut,
    }
}

/// Kills the worker's whole process group, then the worker itself, so helpers
/// it started (browsers, drivers) do not outlive it.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    kill_process_group(child);
    if let Err(err) = child.kill().await {
        warn!(pid = ?child.id(), "Failed to kill worker: {err}");
    }
}

#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // Safety: killpg only sends a signal; the group was created for this worker
    // via `process_group(0)`, so its id equals the worker's pid.
    let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if ret != 0 {
        debug!(pgid, "Failed to signal worker process group: {}", io::Error::last_os_error());
    }
}

/// Captures up to [`MAX_STREAM_BYTES`] and discards the rest, keeping the pipe
/// open until the writer closes it.
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        if (&mut h)
            .take(MAX_STREAM_BYTES)
            .read_to_end(&mut buf)
            .await
            .is_ok()
        {
            let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
        }
    }
    buf
}

async fn drain(task: JoinHandle<Vec<u8>>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(STREAM_DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A grandchild still holds the pipe open.
            abort.abort();
            String::new()
        }
    }
}

fn redact_path(text: String, path: &Path) -> String {
    let needle = path.to_string_lossy();
    if needle.is_empty() || !text.contains(needle.as_ref()) {
        return text;
    }
    text.replace(needle.as_ref(), REDACTED_OUTPUT_PATH)
}

fn discard_output(path: TempPath) {
    let shown = path.display().to_string();
    if let Err(err) = path.close() {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove worker output {shown}: {err}");
        }
    }
}
