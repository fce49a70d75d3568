//! Stream availability probing
//!
//! Two independent checks against the stream endpoint:
//! - shallow: an HTTP HEAD request, available on 200 or 206
//! - deep: an ffprobe run, available on a clean zero exit
//!
//! Neither check ever fails; timeouts and transport errors read as "unavailable".

use crate::config::ProbeConfig;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Internal probe failures. Always folded into `false` before leaving this module.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ffprobe could not be started: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Availability checks against a stream URL.
#[async_trait]
pub trait StreamProbe: Send + Sync {
    /// Header-only existence check. Authoritative.
    async fn shallow(&self, url: &str) -> bool;

    /// Format-level check. Corroborating only.
    async fn deep(&self, url: &str) -> bool;

    /// Combined check: both strategies run concurrently, the shallow result decides.
    async fn probe(&self, url: &str) -> bool {
        let (shallow, deep) = tokio::join!(self.shallow(url), self.deep(url));
        if shallow != deep {
            debug!(url, shallow, deep, "probe strategies disagree");
        }
        shallow
    }
}

/// Treat HTTP 200 and 206 as available.
pub fn is_available_status(status: u16) -> bool {
    status == 200 || status == 206
}

/// Build the ffprobe command for the deep check.
///
/// `-rw_timeout` is in microseconds and bounds ffprobe's own network waits;
/// the outer tokio timeout still applies.
pub fn build_probe_command(ffprobe_path: &str, url: &str, timeout: Duration) -> Command {
    let mut cmd = Command::new(ffprobe_path);
    cmd.args(["-v", "error"]);
    cmd.arg("-rw_timeout")
        .arg(timeout.as_micros().to_string());
    cmd.args(["-print_format", "json", "-show_format"]);
    cmd.arg(url);
    cmd
}

/// Production probe backed by reqwest and ffprobe.
pub struct HttpStreamProbe {
    client: reqwest::Client,
    ffprobe_path: String,
    timeout: Duration,
}

impl HttpStreamProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            ffprobe_path: config.ffprobe_path.clone(),
            timeout,
        }
    }

    async fn head_status(&self, url: &str) -> Result<u16, ProbeError> {
        let request = self.client.head(url).send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;
        Ok(response.status().as_u16())
    }

    async fn ffprobe_succeeds(&self, url: &str) -> Result<bool, ProbeError> {
        let mut cmd = build_probe_command(&self.ffprobe_path, url, self.timeout);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => Ok(status?.success()),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl StreamProbe for HttpStreamProbe {
    async fn shallow(&self, url: &str) -> bool {
        match self.head_status(url).await {
            Ok(status) => {
                debug!(url, status, "HEAD probe");
                is_available_status(status)
            }
            Err(e) => {
                debug!(url, error = %e, "HEAD probe failed");
                false
            }
        }
    }

    async fn deep(&self, url: &str) -> bool {
        match self.ffprobe_succeeds(url).await {
            Ok(ok) => ok,
            Err(e) => {
                debug!(url, error = %e, "ffprobe probe failed");
                false
            }
        }
    }
}
