//! fitenc daemon
//!
//! Background service that shrinks videos to a target file size with a
//! two-pass ffmpeg encode, tracks each job in memory and serves the results
//! over HTTP.

pub mod concurrency;
pub mod daemon;
pub mod job_executor;
pub mod plan;
pub mod probe;
pub mod process;
pub mod progress;
pub mod registry;
pub mod server;
pub mod startup;

pub use fitenc_config as config;
pub use fitenc_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use job_executor::{
    build_pass_args, EncodeRequest, JobError, JobExecutor, JobExecutorConfig, Pass,
};
pub use plan::{plan_encode, EncodePlan, EncodeSettings, Preset};
pub use probe::{probe_media, MediaProbe, ProbeError};
pub use process::{run_process, ProcessError, ProcessOutput, StreamHandlers};
pub use progress::{parse_elapsed_secs, ProgressExtractor};
pub use registry::{
    Job, JobPatch, JobRegistry, JobStatus, LookupError, ProgressReport, ReportStatus,
    SharedRegistry,
};
pub use server::{create_router, run_server, AppState, ServerError};
pub use startup::{check_tool_available, run_startup_checks, StartupError};
