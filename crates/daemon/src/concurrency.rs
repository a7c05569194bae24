//! Concurrency planning for the fitenc daemon
//!
//! Derives how many jobs may encode at once from CPU core count and configuration.

use crate::config::Config;

/// Upper bound for the derived number of concurrent encodes.
const MAX_DERIVED_JOBS: u32 = 4;

/// Logical cores budgeted per concurrent encode when deriving.
const CORES_PER_JOB: u32 = 8;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of jobs encoding at the same time
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the explicit `jobs.max_concurrent_jobs` when non-zero, otherwise
    /// one encode per 8 logical cores, clamped to [1, 4]. x264/x265 already
    /// spread a single encode across all cores.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`derive`](Self::derive) with a known core count
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_jobs = if cfg.jobs.max_concurrent_jobs > 0 {
            cfg.jobs.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

/// Derive max concurrent jobs based on core count
fn derive_max_jobs(cores: u32) -> u32 {
    (cores / CORES_PER_JOB).clamp(1, MAX_DERIVED_JOBS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
