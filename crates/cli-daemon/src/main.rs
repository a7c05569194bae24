//! CLI entry point for fitenc
//!
//! Parses command line arguments, sets up logging and starts the daemon.

use clap::Parser;
use fitenc::{Config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// fitenc - shrink videos to a target file size with two-pass encoding
#[derive(Parser, Debug)]
#[command(name = "fitenc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to serve HTTP on, overriding the configuration
    #[arg(short, long)]
    bind: Option<String>,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<Config, DaemonError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if args.verbose {
            "fitenc=debug".to_string()
        } else {
            "fitenc=info".to_string()
        }
    });
    tracing_subscriber::fmt().with_env_filter(&env_filter).init();

    let daemon_result = load_config(&args).and_then(|config| {
        info!(config = ?args.config, "fitenc starting");
        if args.skip_checks {
            warn!("skipping startup checks (--skip-checks enabled)");
            Daemon::new_without_checks(config)
        } else {
            Daemon::new(config)
        }
    });

    match daemon_result {
        Ok(daemon) => {
            if let Err(e) = daemon.run_with_server().await {
                error!(error = %e, "daemon stopped");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}
