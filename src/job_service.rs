use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    artifact_store::{Artifact, ArtifactStore, StoreError},
    config::Config,
    expiry::ExpiryScheduler,
    models::{Delivery, OutputFormat, ParseRequest},
    process_runner::{ProcessRunner, RunStatus, RunnerError},
};

/// Longest stderr excerpt surfaced to callers; the tail carries the cause.
const MAX_DIAGNOSTIC_CHARS: usize = 4096;

#[derive(Debug, Clone)]
pub struct Job {
    pub target: String,
    pub format: OutputFormat,
    pub max_records: u32,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub enum JobOutput {
    Inline {
        format: OutputFormat,
        content: String,
    },
    Stored {
        format: OutputFormat,
        artifact: Artifact,
    },
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("extraction worker `{program}` is unavailable: {reason}")]
    WorkerNotFound { program: String, reason: String },
    #[error("extraction worker exited with code {exit_code}: {stderr}")]
    WorkerFailed { exit_code: i32, stderr: String },
    #[error("extraction worker exceeded its {timeout_ms}ms deadline")]
    WorkerTimeout { timeout_ms: u64 },
    #[error("extraction worker reported success but produced no usable output")]
    OutputMissing,
    #[error("storage failure: {0}")]
    Storage(String),
}

impl JobError {
    pub fn terminal_state(&self) -> JobState {
        match self {
            Self::WorkerTimeout { .. } => JobState::TimedOut,
            _ => JobState::Failed,
        }
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub timeout: Duration,
    pub retention: Duration,
    pub max_records_limit: u32,
    pub default_max_records: u32,
    pub max_concurrent_jobs: usize,
}

impl JobSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.job_timeout,
            retention: config.retention,
            max_records_limit: config.max_records_limit,
            default_max_records: config.default_max_records,
            max_concurrent_jobs: config.max_concurrent_jobs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobService {
    runner: ProcessRunner,
    store: Arc<ArtifactStore>,
    scheduler: ExpiryScheduler,
    settings: JobSettings,
    slots: Arc<Semaphore>,
}

impl JobService {
    pub fn new(
        runner: ProcessRunner,
        store: Arc<ArtifactStore>,
        scheduler: ExpiryScheduler,
        settings: JobSettings,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            runner,
            store,
            scheduler,
            settings,
            slots,
        }
    }

    pub fn job_from_request(&self, request: ParseRequest) -> Result<Job, JobError> {
        let target = request.url.trim();
        let parsed = Url::parse(target)
            .map_err(|err| JobError::InvalidRequest(format!("url is not a valid URL: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(JobError::InvalidRequest(
                "url must use http or https".to_string(),
            ));
        }

        let max_records = request
            .max_records
            .unwrap_or(self.settings.default_max_records);
        if max_records == 0 || max_records > self.settings.max_records_limit {
            return Err(JobError::InvalidRequest(format!(
                "maxRecords must be between 1 and {}",
                self.settings.max_records_limit
            )));
        }

        Ok(Job {
            target: parsed.to_string(),
            format: request.output_format,
            max_records,
            delivery: request.delivery,
        })
    }

    pub async fn execute(&self, job: Job) -> Result<JobOutput, JobError> {
        let job_id = Uuid::new_v4();
        info!(
            job_id = %job_id,
            target = %job.target,
            format = %job.format,
            max_records = job.max_records,
            state = ?JobState::Created,
            "Extraction job created"
        );

        let result = self.run_job(job_id, &job).await;

        match &result {
            Ok(_) => info!(job_id = %job_id, state = ?JobState::Succeeded, "Extraction job finished"),
            Err(err) => warn!(
                job_id = %job_id,
                state = ?err.terminal_state(),
                "Extraction job failed: {err}"
            ),
        }
        result
    }

    async fn run_job(&self, job_id: Uuid, job: &Job) -> Result<JobOutput, JobError> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| JobError::WorkerNotFound {
                program: self.runner.program().to_string(),
                reason: "job slots are closed".to_string(),
            })?;

        info!(job_id = %job_id, state = ?JobState::Running, "Extraction job running");

        let outcome = self
            .runner
            .run(&job.target, job.format, job.max_records, self.settings.timeout)
            .await
            .map_err(|err| match err {
                RunnerError::WorkerNotFound { program, source } => JobError::WorkerNotFound {
                    program,
                    reason: source.to_string(),
                },
                other @ RunnerError::TempFile(_) => JobError::Storage(other.to_string()),
            })?;

        info!(
            job_id = %job_id,
            status = ?outcome.status,
            exit_code = ?outcome.exit_code,
            elapsed_ms = outcome.elapsed_ms(),
            output_bytes = outcome.output().map_or(0, <[u8]>::len),
            "Extraction worker finished"
        );

        match outcome.status {
            RunStatus::Succeeded => {}
            RunStatus::Failed => {
                return Err(JobError::WorkerFailed {
                    exit_code: outcome.exit_code.unwrap_or(-1),
                    stderr: diagnostic_tail(&outcome.stderr),
                });
            }
            RunStatus::OutputMissing => return Err(JobError::OutputMissing),
            RunStatus::TimedOut => {
                return Err(JobError::WorkerTimeout {
                    timeout_ms: self.settings.timeout.as_millis() as u64,
                });
            }
        }

        let bytes = outcome.into_output().ok_or(JobError::OutputMissing)?;
        match job.delivery {
            Delivery::Inline => {
                let content = String::from_utf8(bytes).map_err(|_| JobError::OutputMissing)?;
                Ok(JobOutput::Inline {
                    format: job.format,
                    content,
                })
            }
            Delivery::Artifact => {
                let file_name = format!("extract-{job_id}.{}", job.format);
                let artifact = self
                    .store
                    .put_bytes(&file_name, self.settings.retention, bytes)
                    .await?;
                self.scheduler.schedule(artifact.id, artifact.expires_at).await;
                Ok(JobOutput::Stored {
                    format: job.format,
                    artifact,
                })
            }
        }
    }
}

fn diagnostic_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= MAX_DIAGNOSTIC_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - MAX_DIAGNOSTIC_CHARS).collect();
    format!("...{tail}")
}
