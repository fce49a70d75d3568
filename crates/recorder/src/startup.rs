//! Preflight checks
//!
//! Verifies that the ffmpeg and ffprobe binaries named in the configuration
//! exist and are recent enough for stream-copy concat and
//! `-reconnect_delay_max`.

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Oldest major version that supports every flag the recorder passes.
pub const MIN_TOOL_MAJOR: u32 = 4;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("{tool} {major}.x is too old; version {MIN_TOOL_MAJOR} or newer is required")]
    ToolTooOld { tool: String, major: u32 },
}

/// Extract the major version from `<tool> -version` output.
///
/// Accepts release builds (`ffmpeg version 6.1.1 ...`) and git builds
/// prefixed with `n` (`ffprobe version n7.0-12-gabc ...`). Snapshot builds
/// with no numeric version yield `None`.
pub fn parse_tool_version(output: &str, tool: &str) -> Option<u32> {
    let marker = format!("{} version", tool.to_lowercase());
    let line = output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains(&marker))?;

    let token = line.split(&marker).nth(1)?.split_whitespace().next()?;
    token
        .trim_start_matches('n')
        .split(['.', '-'])
        .next()?
        .parse()
        .ok()
}

/// Run `<path> -version` and return the parsed major version.
pub fn check_tool_available(path: &str, tool: &str) -> Result<u32, StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: tool.to_string(),
        reason,
    };

    let output = Command::new(path)
        .arg("-version")
        .output()
        .map_err(|e| unavailable(format!("failed to run '{} -version': {}", path, e)))?;

    if !output.status.success() {
        return Err(unavailable(format!("'{} -version' exited with {}", path, output.status)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let major = parse_tool_version(&stdout, tool).ok_or_else(|| {
        unavailable(format!(
            "could not parse version from: {}",
            stdout.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_TOOL_MAJOR {
        return Err(StartupError::ToolTooOld {
            tool: tool.to_string(),
            major,
        });
    }

    info!(tool, path, major, "tool check passed");
    Ok(major)
}

/// Verify ffmpeg then ffprobe.
pub fn run_startup_checks(config: &Config) -> Result<(), StartupError> {
    check_tool_available(&config.capture.ffmpeg_path, "ffmpeg")?;
    check_tool_available(&config.probe.ffprobe_path, "ffprobe")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_release_versions_parse(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
            tool_idx in 0usize..2,
        ) {
            let tool = ["ffmpeg", "ffprobe"][tool_idx];
            let output = format!(
                "{} version {}.{}.{} Copyright (c) 2007-2024 the FFmpeg developers\nbuilt with gcc 13.2.0",
                tool, major, minor, patch
            );
            prop_assert_eq!(parse_tool_version(&output, tool), Some(major));
        }

        #[test]
        fn prop_git_builds_parse(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let output = format!("ffprobe version n{}.{}-45-g{} Copyright (c) 2007-2024", major, minor, git_hash);
            prop_assert_eq!(parse_tool_version(&output, "ffprobe"), Some(major));
        }

        #[test]
        fn prop_other_tool_banner_is_ignored(major in 1u32..20) {
            let output = format!("ffmpeg version {}.0 Copyright (c) 2000-2024", major);
            prop_assert_eq!(parse_tool_version(&output, "ffprobe"), None);
        }
    }

    #[test]
    fn test_parse_snapshot_build_is_none() {
        let output = "ffmpeg version N-113245-g1234567 Copyright (c) 2000-2024";
        assert_eq!(parse_tool_version(output, "ffmpeg"), None);
    }

    #[test]
    fn test_parse_empty_output() {
        assert_eq!(parse_tool_version("", "ffmpeg"), None);
        assert_eq!(parse_tool_version("not a banner", "ffmpeg"), None);
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let err = check_tool_available("/nonexistent/bin/ffmpeg-missing", "ffmpeg").unwrap_err();
        assert!(matches!(err, StartupError::ToolUnavailable { .. }));
        assert!(err.to_string().contains("ffmpeg"));
    }

    #[test]
    fn test_too_old_message_names_minimum() {
        let err = StartupError::ToolTooOld {
            tool: "ffprobe".to_string(),
            major: 3,
        };
        assert_eq!(
            err.to_string(),
            "ffprobe 3.x is too old; version 4 or newer is required"
        );
    }

    #[cfg(unix)]
    mod scripted {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        fn script(dir: &Path, body: &str) -> String {
            let path = dir.join("tool.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        #[test]
        fn test_recent_tool_passes() {
            let dir = tempfile::tempdir().unwrap();
            let path = script(dir.path(), "echo 'ffmpeg version 6.1.1 Copyright (c) 2000-2023'");
            assert_eq!(check_tool_available(&path, "ffmpeg").unwrap(), 6);
        }

        #[test]
        fn test_old_tool_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let path = script(dir.path(), "echo 'ffprobe version 3.4.8 Copyright (c) 2007-2020'");
            let err = check_tool_available(&path, "ffprobe").unwrap_err();
            assert!(matches!(err, StartupError::ToolTooOld { major: 3, .. }));
        }

        #[test]
        fn test_failing_tool_is_unavailable() {
            let dir = tempfile::tempdir().unwrap();
            let path = script(dir.path(), "exit 1");
            let err = check_tool_available(&path, "ffmpeg").unwrap_err();
            assert!(matches!(err, StartupError::ToolUnavailable { .. }));
        }
    }
}
