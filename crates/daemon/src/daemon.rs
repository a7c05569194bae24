//! Daemon startup and main loop for fitenc
//!
//! Wires the registry, the job executor, the reaper and the HTTP server.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::job_executor::{JobExecutor, JobExecutorConfig};
use crate::plan::EncodeSettings;
use crate::registry::{JobRegistry, SharedRegistry};
use crate::server::{run_server, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Work directory could not be prepared
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Every job known to the daemon
    pub registry: SharedRegistry,
    /// Job executor for processing encoding jobs
    pub executor: Arc<JobExecutor>,
}

impl Daemon {
    /// Initialize the daemon
    ///
    /// This performs the full startup sequence:
    /// 1. Run startup checks (ffmpeg, ffprobe)
    /// 2. Derive concurrency plan
    /// 3. Create the work and upload directories, registry and executor
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when ffmpeg and ffprobe are not available.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        std::fs::create_dir_all(&config.jobs.work_dir)?;
        std::fs::create_dir_all(&config.jobs.upload_dir)?;

        let concurrency_plan = derive_plan(&config);
        let registry = JobRegistry::shared(Duration::from_secs(config.jobs.retention_secs));
        let executor = Arc::new(JobExecutor::new(
            concurrency_plan.clone(),
            Arc::clone(&registry),
            JobExecutorConfig::from_config(&config),
        ));

        Ok(Self {
            config,
            concurrency_plan,
            registry,
            executor,
        })
    }

    /// Settings applied to requests that omit a parameter
    pub fn default_settings(&self) -> EncodeSettings {
        EncodeSettings::from(&self.config.defaults)
    }

    /// Start the reaper task
    ///
    /// Purges finished jobs past their retention every `reap_interval_secs`.
    pub fn start_reaper(&self) -> tokio::task::JoinHandle<()> {
        let every = Duration::from_secs(self.config.jobs.reap_interval_secs.max(1));
        self.registry.spawn_reaper(every)
    }

    /// Run the daemon with all background tasks
    ///
    /// Starts the reaper, then serves HTTP until the server fails.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let _reaper_handle = self.start_reaper();

        info!(
            bind = %self.config.server.bind,
            work_dir = %self.config.jobs.work_dir.display(),
            max_concurrent_jobs = self.concurrency_plan.max_concurrent_jobs,
            retention_secs = self.config.jobs.retention_secs,
            "daemon running"
        );

        let state = AppState {
            executor: Arc::clone(&self.executor),
            defaults: self.default_settings(),
            upload_dir: self.config.jobs.upload_dir.clone(),
        };
        run_server(state, &self.config.server.bind).await?;

        Ok(())
    }
}
