//! Startup checks for the fitenc daemon
//!
//! Verifies the external media tools can be executed before any job is
//! accepted:
//! - ffmpeg (`-version`)
//! - ffprobe (`-version`)

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available at {path}: {reason}")]
    ToolUnavailable {
        tool: &'static str,
        path: String,
        reason: String,
    },
}

/// Parse a `-version` banner and extract the major version number
///
/// Handles the standard `ffmpeg version 6.1.1 ...` form, n-prefixed git
/// builds (`ffprobe version n7.0-12-gabc ...`) and returns `None` for
/// snapshot builds that carry no numeric version.
pub fn parse_tool_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(" version "))?;

    let version_part = version_line
        .to_lowercase()
        .split(" version ")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that `path` runs `-version` successfully
///
/// Returns the major version when the banner carries one.
pub fn check_tool_available(tool: &'static str, path: &Path) -> Result<Option<u32>, StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool,
        path: path.display().to_string(),
        reason,
    };

    let output = Command::new(path)
        .arg("-version")
        .output()
        .map_err(|e| unavailable(format!("is it installed and in PATH? {}", e)))?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "-version exited with {}",
            output.status
        )));
    }

    Ok(parse_tool_version(&String::from_utf8_lossy(&output.stdout)))
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    for (tool, path) in [
        ("ffmpeg", &cfg.tools.ffmpeg_path),
        ("ffprobe", &cfg.tools.ffprobe_path),
    ] {
        let major = check_tool_available(tool, path)?;
        info!(tool, path = %path.display(), major_version = ?major, "tool available");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // **Property: Tool Version Parsing**
    //
    // *For any* ffmpeg/ffprobe banner (including n-prefixed git builds), the
    // parser SHALL extract the major version number.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_parsing_standard(
            tool_idx in 0usize..2,
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let tool = ["ffmpeg", "ffprobe"][tool_idx];
            let banner = format!(
                "{} version {}.{}.{} Copyright (c) 2007-2024 the FFmpeg developers\nbuilt with gcc 12.2.0",
                tool, major, minor, patch
            );
            prop_assert_eq!(parse_tool_version(&banner), Some(major));
        }

        #[test]
        fn prop_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let banner = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_tool_version(&banner), Some(major));
        }
    }

    #[test]
    fn test_snapshot_build_has_no_version() {
        let banner = "ffmpeg version N-113000-g1234abcd Copyright (c) 2000-2024";
        assert_eq!(parse_tool_version(banner), None);
        assert_eq!(parse_tool_version(""), None);
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let err = check_tool_available("ffmpeg", Path::new("/nonexistent/fitenc/ffmpeg"))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ffmpeg"));
        assert!(msg.contains("/nonexistent/fitenc/ffmpeg"));
    }
}
