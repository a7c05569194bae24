//! Encoding planner.
//!
//! Pure computations turning a probe result and the caller's settings into an
//! [`EncodePlan`]: preset tier, optional downscale and bitrate allocation.

use crate::config::Codec;
use crate::probe::MediaProbe;
use serde::{Deserialize, Serialize};

/// Frames whose largest side reaches this are downscaled under auto-quality.
pub const ULTRA_HD_THRESHOLD: u32 = 3840;

/// Output height used when downscaling.
pub const DOWNSCALE_HEIGHT: u32 = 1080;

/// Lower bound for the video bitrate in kbps.
pub const MIN_VIDEO_KBPS: u32 = 200;

/// Upper bound for the video bitrate in kbps.
pub const MAX_VIDEO_KBPS: u32 = 50_000;

/// Minimum share of the total bit budget reserved for video.
pub const VIDEO_BUDGET_FLOOR: f64 = 0.70;

/// Audio encoder used for the final pass.
pub const AUDIO_CODEC: &str = "aac";

/// Speed/efficiency trade-off passed to x264/x265 as `-preset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    VeryFast,
    Fast,
    Medium,
    Slow,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::VeryFast => "veryfast",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
        }
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Duration tiers, ordered by upper bound in seconds (inclusive).
/// Anything longer than the last bound gets [`Preset::VeryFast`].
const PRESET_TIERS: &[(f64, Preset)] = &[
    (7.0 * 60.0, Preset::Slow),
    (15.0 * 60.0, Preset::Medium),
    (30.0 * 60.0, Preset::Fast),
];

/// Preset used when auto-quality is disabled.
pub const FIXED_PRESET: Preset = Preset::Medium;

/// Per-job settings supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncodeSettings {
    pub target_mb: f64,
    pub codec: Codec,
    pub audio_kbps: u32,
    pub auto_quality: bool,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            target_mb: 499.0,
            codec: Codec::H264,
            audio_kbps: 128,
            auto_quality: true,
        }
    }
}

impl From<&crate::config::DefaultsConfig> for EncodeSettings {
    fn from(defaults: &crate::config::DefaultsConfig) -> Self {
        Self {
            target_mb: defaults.target_mb,
            codec: defaults.codec,
            audio_kbps: defaults.audio_kbps,
            auto_quality: defaults.auto_quality,
        }
    }
}

/// Visual/speed tuning picked for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityChoice {
    pub preset: Preset,
    pub scale_filter: Option<String>,
}

/// How the target size is split between tracks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateAllocation {
    pub total_bits: f64,
    pub audio_bits: f64,
    pub video_bits: f64,
    pub video_kbps: u32,
}

/// Immutable encoding parameters for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodePlan {
    pub preset: Preset,
    pub scale_filter: Option<String>,
    pub video_kbps: u32,
    pub audio_kbps: u32,
    pub video_codec: Codec,
}

/// Select a preset from the duration tiers: longer content gets a faster preset.
pub fn select_preset(duration_secs: f64) -> Preset {
    PRESET_TIERS
        .iter()
        .find(|(max_secs, _)| duration_secs <= *max_secs)
        .map(|(_, preset)| *preset)
        .unwrap_or(Preset::VeryFast)
}

/// Downscale instruction for ultra-high-resolution frames, keeping aspect ratio.
pub fn scale_filter(max_dimension: u32) -> Option<String> {
    if max_dimension >= ULTRA_HD_THRESHOLD {
        Some(format!("scale=-2:{}", DOWNSCALE_HEIGHT))
    } else {
        None
    }
}

/// Pick preset and scaling. With auto-quality off the fixed preset is used
/// and nothing is scaled.
pub fn choose_quality(max_dimension: u32, duration_secs: f64, auto_quality: bool) -> QualityChoice {
    if !auto_quality {
        return QualityChoice {
            preset: FIXED_PRESET,
            scale_filter: None,
        };
    }

    QualityChoice {
        preset: select_preset(duration_secs),
        scale_filter: scale_filter(max_dimension),
    }
}

/// Split a target size into a video bitrate.
///
/// Video gets whatever audio leaves over, but never less than
/// [`VIDEO_BUDGET_FLOOR`] of the total. The resulting kbps is clamped to
/// [`MIN_VIDEO_KBPS`]..=[`MAX_VIDEO_KBPS`]. This approximates the final size;
/// encoder efficiency and container overhead make the real file deviate.
///
/// `duration_secs` must be positive.
pub fn allocate_bitrate(target_mb: f64, duration_secs: f64, audio_kbps: u32) -> BitrateAllocation {
    let total_bits = target_mb * 1024.0 * 1024.0 * 8.0;
    let audio_bits = audio_kbps as f64 * 1000.0 * duration_secs;
    let video_bits = (total_bits - audio_bits).max(total_bits * VIDEO_BUDGET_FLOOR);

    let video_kbps = (video_bits / duration_secs / 1000.0).round();
    // `as` saturates, so infinities and NaN land on a bound before clamping
    let video_kbps = (video_kbps as u32).clamp(MIN_VIDEO_KBPS, MAX_VIDEO_KBPS);

    BitrateAllocation {
        total_bits,
        audio_bits,
        video_bits,
        video_kbps,
    }
}

/// Build the full plan for a probed input.
///
/// The auto-quality toggle only affects preset and scaling, never the bitrate.
pub fn plan_encode(probe: &MediaProbe, settings: &EncodeSettings) -> EncodePlan {
    let quality = choose_quality(
        probe.max_dimension(),
        probe.duration_secs,
        settings.auto_quality,
    );
    let allocation = allocate_bitrate(
        settings.target_mb,
        probe.duration_secs,
        settings.audio_kbps,
    );

    EncodePlan {
        preset: quality.preset,
        scale_filter: quality.scale_filter,
        video_kbps: allocation.video_kbps,
        audio_kbps: settings.audio_kbps,
        video_codec: settings.codec,
    }
}
