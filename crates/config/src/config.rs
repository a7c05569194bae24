//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Video codec requested for the output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    H264,
    H265,
}

impl Codec {
    /// Encoder name passed to ffmpeg's `-c:v`.
    pub fn encoder(&self) -> &'static str {
        match self {
            Codec::H264 => "libx264",
            Codec::H265 => "libx265",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::H264 => write!(f, "h264"),
            Codec::H265 => write!(f, "h265"),
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Transcoder executable (default "ffmpeg")
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Prober executable (default "ffprobe")
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

/// Job lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Directory holding outputs and two-pass statistics
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Only inputs under this directory are accepted; jobs delete their input
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// How long a finished job is kept before it is purged
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// How often the reaper scans the registry
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Maximum concurrent encodes (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
}

fn default_work_dir() -> PathBuf {
    env::temp_dir().join("fitenc")
}

fn default_upload_dir() -> PathBuf {
    env::temp_dir().join("fitenc-uploads")
}

fn default_retention_secs() -> u64 {
    30 * 60
}

fn default_reap_interval_secs() -> u64 {
    5 * 60
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            upload_dir: default_upload_dir(),
            retention_secs: default_retention_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            max_concurrent_jobs: 0,
        }
    }
}

/// Defaults applied to job requests that omit a parameter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefaultsConfig {
    #[serde(default = "default_target_mb")]
    pub target_mb: f64,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default = "default_audio_kbps")]
    pub audio_kbps: u32,
    #[serde(default = "default_auto_quality")]
    pub auto_quality: bool,
}

fn default_target_mb() -> f64 {
    499.0
}

fn default_audio_kbps() -> u32 {
    128
}

fn default_auto_quality() -> bool {
    true
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            target_mb: default_target_mb(),
            codec: Codec::default(),
            audio_kbps: default_audio_kbps(),
            auto_quality: default_auto_quality(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address (default 127.0.0.1:8080)
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FFMPEG_PATH -> tools.ffmpeg_path
    /// - FFPROBE_PATH -> tools.ffprobe_path
    /// - FITENC_WORK_DIR -> jobs.work_dir
    /// - FITENC_UPLOAD_DIR -> jobs.upload_dir
    /// - FITENC_RETENTION_SECS -> jobs.retention_secs
    /// - FITENC_REAP_INTERVAL_SECS -> jobs.reap_interval_secs
    /// - FITENC_MAX_CONCURRENT_JOBS -> jobs.max_concurrent_jobs
    /// - FITENC_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FFMPEG_PATH") {
            if !val.is_empty() {
                self.tools.ffmpeg_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FFPROBE_PATH") {
            if !val.is_empty() {
                self.tools.ffprobe_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FITENC_WORK_DIR") {
            if !val.is_empty() {
                self.jobs.work_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FITENC_UPLOAD_DIR") {
            if !val.is_empty() {
                self.jobs.upload_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FITENC_RETENTION_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.jobs.retention_secs = secs;
            }
        }

        if let Ok(val) = env::var("FITENC_REAP_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.jobs.reap_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("FITENC_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.jobs.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("FITENC_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Built-in defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}
