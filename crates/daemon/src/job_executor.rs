//! Job executor for the fitenc daemon
//!
//! Drives a job through analysis, planning and a two-pass ffmpeg encode,
//! publishing every milestone to the [`JobRegistry`]. Concurrent encodes are
//! bounded by a semaphore that the registry knows nothing about.

use crate::concurrency::ConcurrencyPlan;
use crate::config::{Codec, Config};
use crate::plan::{plan_encode, EncodePlan, EncodeSettings, AUDIO_CODEC};
use crate::probe::{probe_media, ProbeError};
use crate::process::{run_process, ProcessError, StreamHandlers};
use crate::progress::{progress_message, ProgressExtractor};
use crate::registry::{Job, JobPatch, JobRegistry, JobStatus, SharedRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Percent range covered by the statistics pass.
pub const PASS_ONE_RANGE: (f64, f64) = (2.0, 50.0);

/// Percent range covered by the final pass.
pub const PASS_TWO_RANGE: (f64, f64) = (50.0, 100.0);

/// Where the statistics pass writes its discarded output.
const NULL_SINK: &str = if cfg!(windows) { "NUL" } else { "/dev/null" };

/// Error type for job execution operations
#[derive(Debug, Error)]
pub enum JobError {
    /// Media analysis failed
    #[error("Analysis failed: {0}")]
    Probe(#[from] ProbeError),

    /// An encode pass failed
    #[error("Encode failed: {0}")]
    Process(#[from] ProcessError),

    /// The probe succeeded but gave no positive duration
    #[error("Media duration is unusable ({0} s)")]
    UnusableDuration(f64),

    /// Work directory or output file could not be accessed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which of the two encode passes to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Video-only statistics pass, output discarded
    One,
    /// Final video+audio pass writing the output
    Two,
}

impl Pass {
    fn number(&self) -> &'static str {
        match self {
            Pass::One => "1",
            Pass::Two => "2",
        }
    }
}

/// A request to encode one uploaded file
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    /// Uploaded source; owned by the job and deleted when it finishes
    pub input_path: PathBuf,
    pub settings: EncodeSettings,
}

/// Configuration for the job executor pipeline
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Directory for outputs and two-pass statistics
    pub work_dir: PathBuf,
}

impl JobExecutorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ffmpeg_path: cfg.tools.ffmpeg_path.clone(),
            ffprobe_path: cfg.tools.ffprobe_path.clone(),
            work_dir: cfg.jobs.work_dir.clone(),
        }
    }
}

/// Build the ffmpeg arguments for one pass.
pub fn build_pass_args(
    input: &Path,
    output: &Path,
    passlog_prefix: &Path,
    plan: &EncodePlan,
    pass: Pass,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-i".into(), input.to_string_lossy().into()];

    if let Some(filter) = &plan.scale_filter {
        args.push("-vf".into());
        args.push(filter.clone());
    }

    args.extend([
        "-c:v".to_string(),
        plan.video_codec.encoder().to_string(),
        "-b:v".to_string(),
        format!("{}k", plan.video_kbps),
        "-preset".to_string(),
        plan.preset.as_str().to_string(),
        "-passlogfile".to_string(),
        passlog_prefix.to_string_lossy().to_string(),
        "-pass".to_string(),
        pass.number().to_string(),
    ]);

    match pass {
        Pass::One => {
            args.extend(["-an", "-f", "null", NULL_SINK].map(String::from));
        }
        Pass::Two => {
            if plan.video_codec == Codec::H265 {
                // hvc1 tag keeps HEVC-in-MP4 playable in Apple players
                args.extend(["-tag:v", "hvc1"].map(String::from));
            }
            args.extend([
                "-c:a".to_string(),
                AUDIO_CODEC.to_string(),
                "-b:a".to_string(),
                format!("{}k", plan.audio_kbps),
                "-movflags".to_string(),
                "+faststart".to_string(),
                output.to_string_lossy().to_string(),
            ]);
        }
    }

    args
}

/// Maps one pass's progress into its slice of the job's overall percent.
struct PassProgress<'a> {
    job_id: &'a str,
    registry: &'a JobRegistry,
    extractor: ProgressExtractor,
    range: (f64, f64),
}

impl<'a> PassProgress<'a> {
    fn new(job_id: &'a str, registry: &'a JobRegistry, duration_secs: f64, range: (f64, f64)) -> Self {
        Self {
            job_id,
            registry,
            extractor: ProgressExtractor::new(duration_secs),
            range,
        }
    }

    fn observe(&mut self, line: &str) {
        if let Some(pass_percent) = self.extractor.feed(line) {
            let (start, end) = self.range;
            let overall = start + (end - start) * pass_percent / 100.0;
            self.registry.patch(
                self.job_id,
                JobPatch::new()
                    .percent(overall)
                    .message(progress_message(overall)),
            );
        }
    }
}

/// Job executor that runs encode jobs with concurrency limiting
///
/// Uses a tokio Semaphore to limit the number of concurrent encodes
/// according to the concurrency plan. Jobs waiting for a permit stay queued.
pub struct JobExecutor {
    /// Semaphore for limiting concurrent jobs
    semaphore: Semaphore,
    /// Concurrency plan with the job limit
    concurrency_plan: ConcurrencyPlan,
    /// Registry receiving every state change
    registry: SharedRegistry,
    config: JobExecutorConfig,
}

impl JobExecutor {
    /// Create a new JobExecutor
    pub fn new(plan: ConcurrencyPlan, registry: SharedRegistry, config: JobExecutorConfig) -> Self {
        let permits = plan.max_concurrent_jobs.max(1) as usize;
        Self {
            semaphore: Semaphore::new(permits),
            concurrency_plan: plan,
            registry,
            config,
        }
    }

    /// Get the number of available permits (slots for concurrent jobs)
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the concurrency plan
    pub fn concurrency_plan(&self) -> &ConcurrencyPlan {
        &self.concurrency_plan
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Final artifact location for job `id`
    pub fn output_path(&self, id: &str) -> PathBuf {
        self.config.work_dir.join(format!("{}.mp4", id))
    }

    /// Prefix ffmpeg uses for the two-pass statistics of job `id`
    pub fn passlog_prefix(&self, id: &str) -> PathBuf {
        self.config.work_dir.join(format!("{}-2pass", id))
    }

    /// Register a new job under a fresh id and start it in the background.
    ///
    /// Returns as soon as the job is recorded as queued.
    pub fn submit(self: &Arc<Self>, request: EncodeRequest) -> String {
        let id = Uuid::new_v4().to_string();
        self.start(id.clone(), request);
        id
    }

    /// Record job `id` as queued and run it on a background task.
    pub fn start(self: &Arc<Self>, id: String, request: EncodeRequest) -> tokio::task::JoinHandle<()> {
        self.registry.patch(
            &id,
            JobPatch::new()
                .paths(request.input_path.clone(), self.output_path(&id))
                .status(JobStatus::Queued)
                .percent(0.0)
                .message("Queued…"),
        );

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.execute(&id, request).await;
        })
    }

    /// Execute a job through the encoding pipeline
    ///
    /// 1. Waits for a permit (respecting max_concurrent_jobs)
    /// 2. Probes the input and rejects unusable durations
    /// 3. Plans preset, scaling and bitrate
    /// 4. Runs the statistics pass, then the final pass
    /// 5. Records the output size and marks the job done
    ///
    /// Any failure ends the job in `error`. Statistics files and the input are
    /// removed whatever the outcome. Returns the final job snapshot.
    pub async fn execute(&self, id: &str, request: EncodeRequest) -> Option<Job> {
        // the semaphore is never closed, so a permit always arrives
        let _permit = self.semaphore.acquire().await.ok();

        match self.run_pipeline(id, &request).await {
            Ok(output_bytes) => {
                info!(job_id = %id, output_bytes, "job finished");
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "job failed");
                self.registry.patch(
                    id,
                    JobPatch::new()
                        .status(JobStatus::Error)
                        .message("Failed")
                        .error(e.to_string()),
                );
                remove_best_effort(&self.output_path(id)).await;
            }
        }

        self.remove_passlogs(id).await;
        remove_best_effort(&request.input_path).await;

        self.registry.get(id)
    }

    async fn run_pipeline(&self, id: &str, request: &EncodeRequest) -> Result<u64, JobError> {
        self.registry.patch(
            id,
            JobPatch::new()
                .paths(request.input_path.clone(), self.output_path(id))
                .status(JobStatus::Running)
                .percent(1.0)
                .message("Analyzing…"),
        );

        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        let probe = probe_media(&self.config.ffprobe_path, &request.input_path).await?;
        if !probe.has_usable_duration() {
            return Err(JobError::UnusableDuration(probe.duration_secs));
        }

        let plan = plan_encode(&probe, &request.settings);
        info!(
            job_id = %id,
            duration_secs = probe.duration_secs,
            width = probe.video_width,
            height = probe.video_height,
            preset = %plan.preset,
            scale = ?plan.scale_filter,
            video_kbps = plan.video_kbps,
            audio_kbps = plan.audio_kbps,
            codec = %plan.video_codec,
            "encode planned"
        );

        self.registry
            .patch(id, JobPatch::new().percent(2.0).message("Pass 1/2…"));
        self.run_pass(id, request, &plan, Pass::One, probe.duration_secs)
            .await?;

        self.registry
            .patch(id, JobPatch::new().percent(50.0).message("Pass 2/2…"));
        self.run_pass(id, request, &plan, Pass::Two, probe.duration_secs)
            .await?;

        let output_bytes = tokio::fs::metadata(self.output_path(id)).await?.len();
        self.registry.patch(
            id,
            JobPatch::new()
                .status(JobStatus::Done)
                .percent(100.0)
                .message("Done")
                .output_bytes(output_bytes),
        );

        Ok(output_bytes)
    }

    async fn run_pass(
        &self,
        id: &str,
        request: &EncodeRequest,
        plan: &EncodePlan,
        pass: Pass,
        duration_secs: f64,
    ) -> Result<(), JobError> {
        let args = build_pass_args(
            &request.input_path,
            &self.output_path(id),
            &self.passlog_prefix(id),
            plan,
            pass,
        );
        let range = match pass {
            Pass::One => PASS_ONE_RANGE,
            Pass::Two => PASS_TWO_RANGE,
        };
        debug!(job_id = %id, pass = pass.number(), ?args, "starting ffmpeg pass");

        let mut progress = PassProgress::new(id, &self.registry, duration_secs, range);
        let mut on_diagnostic = |line: &str| progress.observe(line);
        run_process(
            &self.config.ffmpeg_path,
            &args,
            StreamHandlers::diagnostics(&mut on_diagnostic),
        )
        .await?;

        Ok(())
    }

    /// Delete every statistics file ffmpeg wrote for job `id`.
    async fn remove_passlogs(&self, id: &str) {
        let prefix = format!("{}-2pass", id);
        let mut entries = match tokio::fs::read_dir(&self.config.work_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(job_id = %id, error = %e, "cannot list work dir for passlog cleanup");
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                remove_best_effort(&entry.path()).await;
            }
        }
    }
}

/// Delete `path`, logging instead of failing.
async fn remove_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "cleanup failed");
        }
    }
}
