//! Media analyzer.
//!
//! Runs ffprobe with JSON output and extracts the container duration and the
//! geometry of the first video stream.

use crate::process::{run_process, ProcessError, StreamHandlers};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be run or exited non-zero.
    #[error("ffprobe failed: {0}")]
    Process(#[from] ProcessError),

    /// ffprobe output was not valid JSON.
    #[error("Failed to parse ffprobe output: {0}")]
    Parse(String),
}

/// Result of analyzing an input file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MediaProbe {
    /// Container-level duration in seconds (0 when ffprobe reported none).
    pub duration_secs: f64,
    /// Width of the first video stream, 0 without video.
    pub video_width: u32,
    /// Height of the first video stream, 0 without video.
    pub video_height: u32,
}

impl MediaProbe {
    /// Whether the duration can drive bitrate planning.
    pub fn has_usable_duration(&self) -> bool {
        self.duration_secs.is_finite() && self.duration_secs > 0.0
    }

    /// Largest frame dimension.
    pub fn max_dimension(&self) -> u32 {
        self.video_width.max(self.video_height)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Build the ffprobe argument list for `path`.
pub fn ffprobe_args(path: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        path.to_string_lossy().to_string(),
    ]
}

/// Probes a media file using the ffprobe at `ffprobe`.
pub async fn probe_media(ffprobe: &Path, path: &Path) -> Result<MediaProbe, ProbeError> {
    let output = run_process(ffprobe, &ffprobe_args(path), StreamHandlers::default()).await?;
    parse_ffprobe_output(&output.stdout)
}

/// Parses ffprobe JSON output into a MediaProbe.
///
/// A missing or non-numeric duration is not an error here; it yields a probe
/// whose duration is not usable.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaProbe, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .unwrap_or(0.0);

    let video = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let (video_width, video_height) = video
        .map(|s| (s.width.unwrap_or(0), s.height.unwrap_or(0)))
        .unwrap_or((0, 0));

    Ok(MediaProbe {
        duration_secs,
        video_width,
        video_height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ffprobe_output_basic() {
        let json = r#"{
            "streams": [
                {
                    "codec_type": "audio",
                    "codec_name": "aac",
                    "channels": 2
                },
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "width": 3840,
                    "height": 2160,
                    "duration": "12.0"
                },
                {
                    "codec_type": "video",
                    "codec_name": "mjpeg",
                    "width": 600,
                    "height": 600
                }
            ],
            "format": {
                "duration": "600.250000",
                "size": "22548578"
            }
        }"#;

        let probe = parse_ffprobe_output(json).expect("Should parse valid JSON");

        assert!((probe.duration_secs - 600.25).abs() < 1e-9);
        assert_eq!(probe.video_width, 3840);
        assert_eq!(probe.video_height, 2160);
        assert_eq!(probe.max_dimension(), 3840);
        assert!(probe.has_usable_duration());
    }

    #[test]
    fn test_parse_audio_only_yields_zero_geometry() {
        let json = r#"{
            "streams": [{ "codec_type": "audio", "codec_name": "mp3" }],
            "format": { "duration": "180.5" }
        }"#;

        let probe = parse_ffprobe_output(json).unwrap();
        assert_eq!(probe.video_width, 0);
        assert_eq!(probe.video_height, 0);
        assert!(probe.has_usable_duration());
    }

    #[test]
    fn test_missing_duration_is_unusable_not_error() {
        let json = r#"{
            "streams": [{ "codec_type": "video", "width": 1280, "height": 720 }],
            "format": {}
        }"#;
        let probe = parse_ffprobe_output(json).unwrap();
        assert_eq!(probe.duration_secs, 0.0);
        assert!(!probe.has_usable_duration());

        let probe = parse_ffprobe_output(r#"{ "format": { "duration": "N/A" } }"#).unwrap();
        assert!(!probe.has_usable_duration());

        let probe = parse_ffprobe_output(r#"{ "format": { "duration": "-3.0" } }"#).unwrap();
        assert!(!probe.has_usable_duration());

        let probe = parse_ffprobe_output("{}").unwrap();
        assert!(!probe.has_usable_duration());
    }

    #[test]
    fn test_malformed_output_is_parse_error() {
        let err = parse_ffprobe_output("not json at all").unwrap_err();
        assert!(matches!(err, ProbeError::Parse(_)));
    }

    #[test]
    fn test_ffprobe_args_request_json_report() {
        let args = ffprobe_args(Path::new("/uploads/in.mov"));
        assert!(args.windows(2).any(|w| w[0] == "-print_format" && w[1] == "json"));
        assert!(args.contains(&"-show_format".to_string()));
        assert!(args.contains(&"-show_streams".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/uploads/in.mov"));
    }

    #[cfg(unix)]
    fn fake_ffprobe(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffprobe");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_media_non_zero_exit_is_process_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let ffprobe = fake_ffprobe(dir.path(), "echo 'moov atom not found' >&2; exit 1");

        let err = probe_media(&ffprobe, Path::new("/uploads/broken.mp4"))
            .await
            .unwrap_err();

        match err {
            ProbeError::Process(ProcessError::Failed { code, stderr, .. }) => {
                assert_eq!(code, 1);
                assert!(stderr.contains("moov atom not found"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_media_reads_report_from_stdout() {
        let dir = tempfile::TempDir::new().unwrap();
        let ffprobe = fake_ffprobe(
            dir.path(),
            r#"echo '{"streams":[{"codec_type":"video","width":3840,"height":2160}],"format":{"duration":"90.5"}}'"#,
        );

        let probe = probe_media(&ffprobe, Path::new("/uploads/clip.mov")).await.unwrap();

        assert_eq!(probe.duration_secs, 90.5);
        assert_eq!(probe.max_dimension(), 3840);
    }
}
