//! In-memory job registry.
//!
//! Owns every [`Job`] record. All mutation goes through [`JobRegistry::patch`],
//! which applies a [`JobPatch`] under a single write lock so readers never see
//! a half-applied update. A background reaper purges finished jobs and their
//! output files once they outlive the retention window.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Bytes per megabyte when reporting output size.
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Errors surfaced to callers querying the registry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    /// No job with this identifier exists
    #[error("job {0} not found")]
    MissingJob(String),

    /// The job exists but has no artifact yet
    #[error("job {id} is not ready (status: {status})")]
    JobNotReady { id: String, status: JobStatus },
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, waiting for an encode slot.
    Queued,
    /// Analysis or encoding in progress.
    Running,
    /// Output is available.
    Done,
    /// The job failed; see `error`.
    Error,
}

impl JobStatus {
    /// `Done` and `Error` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One encoding job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// 0..=100, non-decreasing while running.
    pub percent: f64,
    pub message: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Set once on entering `Done`.
    pub output_bytes: Option<u64>,
    /// Set once on entering `Error`.
    pub error: Option<String>,
    /// Stamped by the reaper the first time it sees the job finished; anchors retention.
    pub created_at: Option<Instant>,
}

impl Job {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::Queued,
            percent: 0.0,
            message: String::new(),
            input_path: PathBuf::new(),
            output_path: PathBuf::new(),
            output_bytes: None,
            error: None,
            created_at: None,
        }
    }
}

/// Field-wise update merged into a job record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub percent: Option<f64>,
    pub message: Option<String>,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub output_bytes: Option<u64>,
    pub error: Option<String>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn percent(mut self, percent: f64) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn paths(mut self, input: PathBuf, output: PathBuf) -> Self {
        self.input_path = Some(input);
        self.output_path = Some(output);
        self
    }

    pub fn output_bytes(mut self, bytes: u64) -> Self {
        self.output_bytes = Some(bytes);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Merge into `job`. A terminal job is left untouched.
    fn apply(self, job: &mut Job) -> bool {
        if job.status.is_terminal() {
            return false;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(percent) = self.percent {
            job.percent = percent.clamp(0.0, 100.0);
        }
        if let Some(message) = self.message {
            job.message = message;
        }
        if let Some(input_path) = self.input_path {
            job.input_path = input_path;
        }
        if let Some(output_path) = self.output_path {
            job.output_path = output_path;
        }
        if job.status == JobStatus::Done {
            job.output_bytes = self.output_bytes.or(job.output_bytes);
        }
        if job.status == JobStatus::Error {
            job.error = self.error.or(job.error.take());
        }
        true
    }
}

/// Answer to a progress query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mb: Option<f64>,
}

/// Job status as seen by a progress query, including the missing case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Queued,
    Running,
    Done,
    Error,
    Missing,
}

impl From<JobStatus> for ReportStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => ReportStatus::Queued,
            JobStatus::Running => ReportStatus::Running,
            JobStatus::Done => ReportStatus::Done,
            JobStatus::Error => ReportStatus::Error,
        }
    }
}

impl ProgressReport {
    pub fn missing() -> Self {
        Self {
            status: ReportStatus::Missing,
            percent: None,
            message: None,
            error: None,
            output_mb: None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.status == ReportStatus::Missing
    }

    fn from_job(job: &Job) -> Self {
        Self {
            status: job.status.into(),
            percent: Some(job.percent),
            message: Some(job.message.clone()),
            error: job.error.clone(),
            output_mb: job
                .output_bytes
                .filter(|_| job.status == JobStatus::Done)
                .map(|bytes| bytes as f64 / BYTES_PER_MB),
        }
    }
}

/// Shared registry handle
pub type SharedRegistry = Arc<JobRegistry>;

/// Mapping from job id to job state with time-based retention.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Job>>,
    retention: Duration,
}

impl JobRegistry {
    /// Create an empty registry that keeps finished jobs for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Create a shared registry.
    pub fn shared(retention: Duration) -> SharedRegistry {
        Arc::new(Self::new(retention))
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Merge `patch` into the job `id`, creating a queued record if needed.
    ///
    /// Returns the resulting snapshot. Patches against a terminal job are
    /// dropped so a job never leaves `Done` or `Error`.
    pub fn patch(&self, id: &str, patch: JobPatch) -> Job {
        let mut jobs = self.jobs.write();
        let job = jobs.entry(id.to_string()).or_insert_with(|| Job::new(id));
        if !patch.apply(job) {
            debug!(job_id = %id, status = %job.status, "ignoring update to finished job");
        }
        job.clone()
    }

    /// Snapshot of job `id`.
    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    /// Number of tracked jobs.
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Progress view of job `id`; unknown ids yield a `missing` report.
    pub fn progress(&self, id: &str) -> ProgressReport {
        match self.jobs.read().get(id) {
            Some(job) => ProgressReport::from_job(job),
            None => ProgressReport::missing(),
        }
    }

    /// Output path of job `id`, available only once it is done.
    pub fn artifact(&self, id: &str) -> Result<PathBuf, LookupError> {
        let jobs = self.jobs.read();
        let job = jobs
            .get(id)
            .ok_or_else(|| LookupError::MissingJob(id.to_string()))?;
        if job.status != JobStatus::Done {
            return Err(LookupError::JobNotReady {
                id: id.to_string(),
                status: job.status,
            });
        }
        Ok(job.output_path.clone())
    }

    /// One reaper pass at time `now`.
    ///
    /// Stamps `created_at` on terminal jobs seen for the first time, then
    /// removes every terminal job stamped longer ago than the retention window
    /// and deletes its output. In-flight jobs are never stamped nor touched.
    /// Returns the ids removed.
    pub async fn reap(&self, now: Instant) -> Vec<String> {
        let expired = self.take_expired(now);

        for job in &expired {
            if job.output_path.as_os_str().is_empty() {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(&job.output_path).await {
                debug!(job_id = %job.id, error = %e, "could not delete expired output");
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "purged expired jobs");
        }
        expired.into_iter().map(|job| job.id).collect()
    }

    /// Stamp newly finished jobs and pull out the expired ones under one lock.
    fn take_expired(&self, now: Instant) -> Vec<Job> {
        let mut jobs = self.jobs.write();
        for job in jobs.values_mut().filter(|job| job.status.is_terminal()) {
            job.created_at.get_or_insert(now);
        }
        let ids: Vec<String> = jobs
            .values()
            .filter(|job| {
                job.status.is_terminal()
                    && job
                        .created_at
                        .is_some_and(|at| now.saturating_duration_since(at) > self.retention)
            })
            .map(|job| job.id.clone())
            .collect();
        ids.iter().filter_map(|id| jobs.remove(id)).collect()
    }

    /// Spawn the periodic reaper.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                registry.reap(tokio::time::Instant::now().into_std()).await;
            }
        })
    }
}
