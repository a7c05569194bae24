//! Progress extraction from ffmpeg's diagnostic stream.

use regex::Regex;
use std::sync::LazyLock;

/// ffmpeg status lines report elapsed output time as `time=HH:MM:SS.ff`.
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(\d+):(\d{1,2}):(\d{1,2}(?:\.\d+)?)").expect("invalid time regex")
});

/// Elapsed seconds from the last `time=` marker in `chunk`, if any.
pub fn parse_elapsed_secs(chunk: &str) -> Option<f64> {
    let caps = TIME_RE.captures_iter(chunk).last()?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Per-invocation progress state.
///
/// Fed diagnostic chunks, it yields a completion percentage in `[0, 100]`
/// whenever the value is at least the last one reported. One extractor
/// covers one encode pass; values are relative to that pass.
#[derive(Debug, Clone)]
pub struct ProgressExtractor {
    total_duration_secs: f64,
    last_percent: f64,
}

impl ProgressExtractor {
    pub fn new(total_duration_secs: f64) -> Self {
        Self {
            total_duration_secs,
            last_percent: 0.0,
        }
    }

    /// Last percentage reported by [`feed`](Self::feed).
    pub fn last_percent(&self) -> f64 {
        self.last_percent
    }

    /// Feed one line or chunk of diagnostic text.
    ///
    /// Returns the new percentage to publish, or `None` when the chunk has no
    /// timestamp or would move progress backwards.
    pub fn feed(&mut self, chunk: &str) -> Option<f64> {
        if self.total_duration_secs.is_nan() || self.total_duration_secs <= 0.0 {
            return None;
        }
        let elapsed = parse_elapsed_secs(chunk)?;
        let percent = (elapsed * 100.0 / self.total_duration_secs).clamp(0.0, 100.0);
        if percent < self.last_percent {
            return None;
        }
        self.last_percent = percent;
        Some(percent)
    }
}

/// Human-readable status line for a progress update.
pub fn progress_message(percent: f64) -> String {
    format!("Encoding… {}%", percent.floor() as u32)
}
