//! Segment capture via an ffmpeg subprocess
//!
//! One [`FfmpegCapture::run`] call owns exactly one ffmpeg process. The
//! process exit status decides the outcome; stderr is only read for logging
//! and progress.

use crate::config::CaptureConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// stderr substrings that point at an upstream problem
const FATAL_PATTERNS: &[&str] = &[
    "403 Forbidden",
    "404 Not Found",
    "Connection refused",
    "Connection timed out",
    "Input/output error",
    "Server returned",
];

/// Why a capture attempt was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The process exited before producing a usable segment.
    #[error("capture ended after {elapsed_ms} ms, below the {min_viable_ms} ms threshold")]
    FailedFast { elapsed_ms: u64, min_viable_ms: u64 },

    #[error("ffmpeg exited with code {0}")]
    Exit(i32),

    #[error("ffmpeg was terminated by signal")]
    Terminated,

    #[error("capture produced no output file")]
    MissingOutput,

    #[error("failed to run ffmpeg: {0}")]
    Io(String),
}

/// Resolution of one capture attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// Segment retained on disk.
    Success { duration_ms: u64, path: PathBuf },
    /// Attempt discarded; any partial file has been removed.
    Failure(CaptureError),
    /// Cancelled by a stop request; whatever ffmpeg flushed is left in place.
    Stopped { path: Option<PathBuf> },
}

/// Parameters for one capture attempt.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub url: String,
    pub duration_secs: u64,
    pub dest: PathBuf,
    /// Latest `time=` reported by ffmpeg for this attempt, in ms.
    pub progress_ms: Arc<AtomicU64>,
}

impl CaptureRequest {
    pub fn new(url: &str, duration_secs: u64, dest: PathBuf) -> Self {
        Self {
            url: url.to_string(),
            duration_secs,
            dest,
            progress_ms: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Something that can record `duration_secs` of a stream into a file.
#[async_trait]
pub trait SegmentCapture: Send + Sync {
    async fn run(&self, request: CaptureRequest, cancel: CancellationToken) -> CaptureOutcome;
}

fn is_http(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Build the ffmpeg command for one segment.
///
/// Streams are copied without re-encoding, the destination is overwritten,
/// and HTTP inputs get ffmpeg's reconnect options.
pub fn build_capture_command(
    ffmpeg_path: &str,
    url: &str,
    duration_secs: u64,
    reconnect_delay_max_secs: u64,
    dest: &Path,
) -> Command {
    let mut cmd = Command::new(ffmpeg_path);

    cmd.args(["-hide_banner", "-nostdin", "-y"]);
    cmd.args(["-loglevel", "info"]);

    if is_http(url) {
        cmd.args(["-reconnect", "1"]);
        cmd.args(["-reconnect_streamed", "1"]);
        cmd.args(["-reconnect_on_network_error", "1"]);
        cmd.arg("-reconnect_delay_max")
            .arg(reconnect_delay_max_secs.to_string());
    }

    cmd.arg("-i").arg(url);
    cmd.arg("-t").arg(duration_secs.to_string());
    cmd.args(["-c", "copy"]);
    cmd.arg(dest);

    cmd
}

/// Decide whether a finished attempt produced a usable segment.
///
/// An attempt that ends at or before `min_viable` is a failure whatever its
/// exit status: that pattern means the connection was rejected up front.
pub fn classify_exit(
    exit_code: Option<i32>,
    success: bool,
    output_exists: bool,
    elapsed: Duration,
    min_viable: Duration,
) -> Result<(), CaptureError> {
    if elapsed <= min_viable {
        return Err(CaptureError::FailedFast {
            elapsed_ms: elapsed.as_millis() as u64,
            min_viable_ms: min_viable.as_millis() as u64,
        });
    }
    if !success {
        return Err(match exit_code {
            Some(code) => CaptureError::Exit(code),
            None => CaptureError::Terminated,
        });
    }
    if !output_exists {
        return Err(CaptureError::MissingOutput);
    }
    Ok(())
}

/// Extract `time=HH:MM:SS.xx` from an ffmpeg progress line, in ms.
pub fn parse_progress_time(line: &str) -> Option<u64> {
    let start = line.find("time=")? + "time=".len();
    let value = line[start..].split_whitespace().next()?;

    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || seconds < 0.0 {
        return None;
    }

    Some(hours * 3_600_000 + minutes * 60_000 + (seconds * 1000.0).round() as u64)
}

/// First known fatal pattern contained in `line`.
pub fn match_fatal_pattern(line: &str) -> Option<&'static str> {
    FATAL_PATTERNS.iter().find(|p| line.contains(*p)).copied()
}

/// Read ffmpeg's stderr to EOF. Progress lines end in `\r`, log lines in `\n`.
async fn watch_diagnostics<R>(stderr: R, progress_ms: Arc<AtomicU64>)
where
    R: AsyncRead + Unpin,
{
    let mut chunks = BufReader::new(stderr).split(b'\r');
    while let Ok(Some(chunk)) = chunks.next_segment().await {
        let text = String::from_utf8_lossy(&chunk);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(ms) = parse_progress_time(line) {
                progress_ms.store(ms, Ordering::Relaxed);
                debug!(progress_ms = ms, "capture progress");
            } else if let Some(pattern) = match_fatal_pattern(line) {
                warn!(pattern, line, "capture reported an upstream error");
            } else {
                debug!(line, "ffmpeg");
            }
        }
    }
}

/// SIGTERM first so ffmpeg can finalize the container, then a hard kill.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(grace_ms = grace.as_millis() as u64, "capture ignored SIGTERM, killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "could not remove partial segment");
        }
    }
}

/// Production capture backed by ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegCapture {
    ffmpeg_path: String,
    reconnect_delay_max_secs: u64,
    min_viable: Duration,
    stop_grace: Duration,
}

impl FfmpegCapture {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            reconnect_delay_max_secs: config.reconnect_delay_max_secs,
            min_viable: Duration::from_secs(config.min_viable_secs),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
        }
    }

    /// Override the viability threshold.
    pub fn with_min_viable(mut self, min_viable: Duration) -> Self {
        self.min_viable = min_viable;
        self
    }
}

#[async_trait]
impl SegmentCapture for FfmpegCapture {
    async fn run(&self, request: CaptureRequest, cancel: CancellationToken) -> CaptureOutcome {
        let CaptureRequest {
            url,
            duration_secs,
            dest,
            progress_ms,
        } = request;

        let mut cmd = build_capture_command(
            &self.ffmpeg_path,
            &url,
            duration_secs,
            self.reconnect_delay_max_secs,
            &dest,
        );
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_partial(&dest);
                return CaptureOutcome::Failure(CaptureError::Io(e.to_string()));
            }
        };
        info!(
            pid = child.id(),
            duration_secs,
            dest = %dest.display(),
            "capture started"
        );

        let diagnostics = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(watch_diagnostics(stderr, progress_ms)));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status,
            None => {
                info!(pid = child.id(), "stopping capture");
                terminate(&mut child, self.stop_grace).await;
                if let Some(handle) = diagnostics {
                    let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
                }
                let path = dest.exists().then_some(dest);
                return CaptureOutcome::Stopped { path };
            }
        };

        // stderr hits EOF once ffmpeg is gone
        if let Some(handle) = diagnostics {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }

        let elapsed = started.elapsed();
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                remove_partial(&dest);
                return CaptureOutcome::Failure(CaptureError::Io(e.to_string()));
            }
        };

        match classify_exit(
            status.code(),
            status.success(),
            dest.exists(),
            elapsed,
            self.min_viable,
        ) {
            Ok(()) => {
                let duration_ms = elapsed.as_millis() as u64;
                info!(duration_ms, dest = %dest.display(), "capture finished");
                CaptureOutcome::Success {
                    duration_ms,
                    path: dest,
                }
            }
            Err(reason) => {
                warn!(%reason, elapsed_ms = elapsed.as_millis() as u64, "capture failed");
                remove_partial(&dest);
                CaptureOutcome::Failure(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Anything that ends within the threshold is a failure, whatever it reports.
        #[test]
        fn prop_fast_exit_always_fails(
            elapsed_ms in 0u64..=4000,
            code in proptest::option::of(-1i32..255),
            success in any::<bool>(),
            exists in any::<bool>(),
        ) {
            let result = classify_exit(
                code,
                success,
                exists,
                Duration::from_millis(elapsed_ms),
                Duration::from_secs(5),
            );
            let is_fast_failure = matches!(result, Err(CaptureError::FailedFast { .. }));
            prop_assert!(is_fast_failure);
        }

        #[test]
        fn prop_viable_clean_exit_succeeds(elapsed_ms in 5001u64..10_000_000) {
            let result = classify_exit(
                Some(0),
                true,
                true,
                Duration::from_millis(elapsed_ms),
                Duration::from_secs(5),
            );
            prop_assert_eq!(result, Ok(()));
        }

        #[test]
        fn prop_capture_command_completeness(
            duration in 1u64..100_000,
            delay in 1u64..60,
            name in "[a-z0-9_]{1,20}",
        ) {
            let url = "https://cdn.example.com/live/stream.m3u8";
            let dest = PathBuf::from(format!("/tmp/{}.ts", name));
            let cmd = build_capture_command("ffmpeg", url, duration, delay, &dest);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.as_std().get_program(), OsStr::new("ffmpeg"));
            prop_assert!(has_flag_with_value(&args, "-i", url));
            prop_assert!(has_flag_with_value(&args, "-t", &duration.to_string()));
            prop_assert!(has_flag_with_value(&args, "-c", "copy"));
            prop_assert!(has_flag_with_value(&args, "-reconnect", "1"));
            prop_assert!(has_flag_with_value(&args, "-reconnect_delay_max", &delay.to_string()));
            prop_assert!(has_flag(&args, "-y"));
            let dest_str = dest.to_string_lossy().to_string();
            prop_assert_eq!(args.last(), Some(&dest_str));
        }
    }

    #[test]
    fn test_classify_exit_failures() {
        let min = Duration::from_secs(5);
        let long = Duration::from_secs(60);

        assert_eq!(classify_exit(Some(1), false, true, long, min), Err(CaptureError::Exit(1)));
        assert_eq!(classify_exit(None, false, true, long, min), Err(CaptureError::Terminated));
        assert_eq!(
            classify_exit(Some(0), true, false, long, min),
            Err(CaptureError::MissingOutput)
        );
        assert_eq!(
            classify_exit(Some(0), true, true, min, min),
            Err(CaptureError::FailedFast { elapsed_ms: 5000, min_viable_ms: 5000 })
        );
    }

    #[test]
    fn test_non_http_input_skips_reconnect_flags() {
        let cmd = build_capture_command(
            "ffmpeg",
            "rtmp://live.example.com/app/key",
            60,
            5,
            Path::new("/tmp/out.ts"),
        );
        let args = get_command_args(&cmd);
        assert!(!has_flag(&args, "-reconnect"));
        assert!(has_flag_with_value(&args, "-i", "rtmp://live.example.com/app/key"));
    }

    #[test]
    fn test_parse_progress_time() {
        let line = "frame= 1500 fps= 25 q=-1.0 size=   20480kB time=00:01:02.50 bitrate=2684.4kbits/s speed=1.0x";
        assert_eq!(parse_progress_time(line), Some(62_500));
        assert_eq!(parse_progress_time("size=N/A time=01:00:00.00 bitrate=N/A"), Some(3_600_000));
        assert_eq!(parse_progress_time("size=N/A time=N/A bitrate=N/A"), None);
        assert_eq!(parse_progress_time("Input #0, hls, from 'http://x'"), None);
    }

    #[test]
    fn test_match_fatal_pattern() {
        assert_eq!(
            match_fatal_pattern("[https @ 0x55] HTTP error 403 Forbidden"),
            Some("403 Forbidden")
        );
        assert_eq!(
            match_fatal_pattern("tcp://10.0.0.1:80: Connection refused"),
            Some("Connection refused")
        );
        assert_eq!(match_fatal_pattern("Stream mapping:"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let capture = FfmpegCapture::new(&CaptureConfig {
            ffmpeg_path: "/nonexistent/bin/ffmpeg".to_string(),
            ..CaptureConfig::default()
        });
        let request = CaptureRequest::new("http://127.0.0.1:9/live", 10, dir.path().join("a.ts"));

        let outcome = capture.run(request, CancellationToken::new()).await;
        assert!(matches!(outcome, CaptureOutcome::Failure(CaptureError::Io(_))));
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// Write a fake ffmpeg that writes its last argument and then runs `body`.
        fn fake_ffmpeg(dir: &TempDir, body: &str) -> String {
            let path = dir.path().join("fake-ffmpeg.sh");
            let script = format!(
                "#!/bin/sh\nfor last; do :; done\nprintf 'segment-bytes' > \"$last\"\n{}\n",
                body
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().to_string()
        }

        fn capture_for(ffmpeg_path: String) -> FfmpegCapture {
            FfmpegCapture::new(&CaptureConfig {
                ffmpeg_path,
                stop_grace_ms: 1000,
                ..CaptureConfig::default()
            })
            .with_min_viable(Duration::from_millis(100))
        }

        #[tokio::test]
        async fn test_viable_capture_keeps_file() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(
                &dir,
                "echo 'size=1kB time=00:00:01.50 bitrate=1k speed=1x' >&2\nsleep 0.4\nexit 0",
            );
            let dest = dir.path().join("seg.ts");
            let request = CaptureRequest::new("http://example.com/live", 30, dest.clone());
            let progress = request.progress_ms.clone();

            let outcome = capture_for(ffmpeg).run(request, CancellationToken::new()).await;

            match outcome {
                CaptureOutcome::Success { duration_ms, path } => {
                    assert!(duration_ms >= 300);
                    assert_eq!(path, dest);
                }
                other => panic!("expected success, got {:?}", other),
            }
            assert!(dest.exists());
            assert_eq!(progress.load(Ordering::Relaxed), 1500);
        }

        #[tokio::test]
        async fn test_instant_exit_is_failure_and_removes_file() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(&dir, "exit 0");
            let dest = dir.path().join("seg.ts");
            let request = CaptureRequest::new("http://example.com/live", 30, dest.clone());

            let capture = capture_for(ffmpeg).with_min_viable(Duration::from_secs(4));
            let outcome = capture.run(request, CancellationToken::new()).await;

            assert!(matches!(
                outcome,
                CaptureOutcome::Failure(CaptureError::FailedFast { .. })
            ));
            assert!(!dest.exists());
        }

        #[tokio::test]
        async fn test_late_error_exit_is_failure() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(
                &dir,
                "echo 'HTTP error 403 Forbidden' >&2\nsleep 0.3\nexit 3",
            );
            let dest = dir.path().join("seg.ts");
            let request = CaptureRequest::new("http://example.com/live", 30, dest.clone());

            let outcome = capture_for(ffmpeg).run(request, CancellationToken::new()).await;

            assert_eq!(outcome, CaptureOutcome::Failure(CaptureError::Exit(3)));
            assert!(!dest.exists());
        }

        #[tokio::test]
        async fn test_cancel_terminates_capture_promptly() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(&dir, "exec sleep 30");
            let dest = dir.path().join("seg.ts");
            let request = CaptureRequest::new("http://example.com/live", 30, dest.clone());
            let cancel = CancellationToken::new();

            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });

            let started = Instant::now();
            let outcome = capture_for(ffmpeg).run(request, cancel).await;

            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(outcome, CaptureOutcome::Stopped { path: Some(dest) });
        }
    }
}
