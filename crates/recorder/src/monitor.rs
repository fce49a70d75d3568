//! Outage monitoring
//!
//! While the stream is down, and after one `fast_interval` of quiet, two
//! loops poll the [`StreamProbe`]:
//! - a fast loop issuing shallow checks on a fixed interval
//! - a deep loop that resubmits the deep check a short delay after each
//!   attempt completes, and asks the shallow check to confirm a hit
//!
//! The first loop to see the stream back clears the shared `active` flag
//! and reports; the other loop's report is dropped.

use crate::config::ProbeConfig;
use crate::probe::StreamProbe;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the recorder knows about stream reachability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityState {
    pub available: bool,
    pub last_available_unix_ms: Option<i64>,
    pub consecutive_failures: u32,
}

impl AvailabilityState {
    pub fn record_success(&mut self) {
        self.available = true;
        self.last_available_unix_ms = Some(current_timestamp_ms());
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.available = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

pub type SharedAvailability = Arc<RwLock<AvailabilityState>>;

/// Polling cadence for the two loops.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub fast_interval: Duration,
    pub deep_rearm: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            fast_interval: Duration::from_millis(config.fast_interval_ms),
            deep_rearm: Duration::from_millis(config.deep_rearm_ms),
        }
    }
}

/// How a [`OutageMonitor::watch`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchResult {
    /// The stream is reachable again.
    Resumed,
    /// The session was stopped while monitoring.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum ResumeSource {
    Fast,
    Deep,
}

pub struct OutageMonitor {
    probe: Arc<dyn StreamProbe>,
    settings: MonitorSettings,
    state: SharedAvailability,
}

impl OutageMonitor {
    pub fn new(probe: Arc<dyn StreamProbe>, settings: MonitorSettings) -> Self {
        Self {
            probe,
            settings,
            state: Arc::new(RwLock::new(AvailabilityState::default())),
        }
    }

    /// Shared availability state, read for status reporting.
    pub fn state(&self) -> SharedAvailability {
        self.state.clone()
    }

    pub async fn record_available(&self) {
        self.state.write().await.record_success();
    }

    pub async fn record_unavailable(&self) {
        self.state.write().await.record_failure();
    }

    /// Poll until the stream is back or `cancel` fires.
    ///
    /// Nothing is probed during the first `fast_interval`, so a capture that
    /// fails against a stream that still answers probes is retried at most
    /// once per interval. Both loops are stopped and joined before this returns.
    pub async fn watch(&self, url: &str, cancel: &CancellationToken) -> WatchResult {
        info!(url, "monitoring stream for availability");

        tokio::select! {
            _ = cancel.cancelled() => return WatchResult::Cancelled,
            _ = tokio::time::sleep(self.settings.fast_interval) => {}
        }

        let loops = cancel.child_token();
        let active = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::channel(2);

        let fast = tokio::spawn(fast_loop(
            self.probe.clone(),
            url.to_string(),
            self.settings.fast_interval,
            self.state.clone(),
            active.clone(),
            tx.clone(),
            loops.clone(),
        ));
        let deep = tokio::spawn(deep_loop(
            self.probe.clone(),
            url.to_string(),
            self.settings.deep_rearm,
            self.state.clone(),
            active,
            tx,
            loops.clone(),
        ));

        let result = tokio::select! {
            Some(source) = rx.recv() => {
                info!(?source, "stream available again");
                WatchResult::Resumed
            }
            _ = cancel.cancelled() => WatchResult::Cancelled,
            else => WatchResult::Cancelled,
        };

        loops.cancel();
        let _ = tokio::join!(fast, deep);
        result
    }
}

/// Clear the monitoring flag; true only for the first caller.
fn claim(active: &AtomicBool) -> bool {
    active
        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

async fn fast_loop(
    probe: Arc<dyn StreamProbe>,
    url: String,
    interval: Duration,
    state: SharedAvailability,
    active: Arc<AtomicBool>,
    tx: mpsc::Sender<ResumeSource>,
    cancel: CancellationToken,
) {
    while active.load(Ordering::Acquire) {
        let available = tokio::select! {
            _ = cancel.cancelled() => break,
            available = probe.shallow(&url) => available,
        };

        {
            let mut state = state.write().await;
            if available {
                state.record_success();
            } else {
                state.record_failure();
                debug!(failures = state.consecutive_failures, "stream still unavailable");
            }
        }

        if available && claim(&active) {
            let _ = tx.send(ResumeSource::Fast).await;
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn deep_loop(
    probe: Arc<dyn StreamProbe>,
    url: String,
    rearm: Duration,
    state: SharedAvailability,
    active: Arc<AtomicBool>,
    tx: mpsc::Sender<ResumeSource>,
    cancel: CancellationToken,
) {
    while active.load(Ordering::Acquire) {
        let deep_ok = tokio::select! {
            _ = cancel.cancelled() => break,
            ok = probe.deep(&url) => ok,
        };

        if deep_ok {
            debug!("deep probe succeeded, confirming with shallow probe");
            let confirmed = tokio::select! {
                _ = cancel.cancelled() => break,
                ok = probe.shallow(&url) => ok,
            };
            if confirmed {
                state.write().await.record_success();
                if claim(&active) {
                    let _ = tx.send(ResumeSource::Deep).await;
                }
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(rearm) => {}
        }
    }
}

fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Shallow probe turns true after `shallow_fails` calls; deep probe after `deep_fails`.
    struct Scripted {
        shallow_fails: usize,
        deep_fails: usize,
        shallow_calls: AtomicUsize,
        deep_calls: AtomicUsize,
    }

    impl Scripted {
        fn new(shallow_fails: usize, deep_fails: usize) -> Arc<Self> {
            Arc::new(Self {
                shallow_fails,
                deep_fails,
                shallow_calls: AtomicUsize::new(0),
                deep_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamProbe for Scripted {
        async fn shallow(&self, _url: &str) -> bool {
            self.shallow_calls.fetch_add(1, Ordering::SeqCst) >= self.shallow_fails
        }
        async fn deep(&self, _url: &str) -> bool {
            self.deep_calls.fetch_add(1, Ordering::SeqCst) >= self.deep_fails
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            fast_interval: Duration::from_millis(20),
            deep_rearm: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_resumes_once_stream_returns() {
        let probe = Scripted::new(3, usize::MAX);
        let monitor = OutageMonitor::new(probe.clone(), settings());

        let result = monitor.watch("http://x/live", &CancellationToken::new()).await;

        assert_eq!(result, WatchResult::Resumed);
        let state = monitor.state().read().await.clone();
        assert!(state.available);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_available_unix_ms.is_some());
    }

    #[tokio::test]
    async fn test_deep_hit_without_shallow_confirmation_does_not_resume() {
        // Deep probe always succeeds; shallow never does.
        let probe = Scripted::new(usize::MAX, 0);
        let monitor = OutageMonitor::new(probe.clone(), settings());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let result = monitor.watch("http://x/live", &cancel).await;
        assert_eq!(result, WatchResult::Cancelled);
        assert!(probe.deep_calls.load(Ordering::SeqCst) > 1);
        assert!(monitor.state().read().await.consecutive_failures > 0);
    }

    #[tokio::test]
    async fn test_loops_stop_after_resume() {
        let probe = Scripted::new(0, 0);
        let monitor = OutageMonitor::new(probe.clone(), settings());

        let result = monitor.watch("http://x/live", &CancellationToken::new()).await;
        assert_eq!(result, WatchResult::Resumed);

        let shallow = probe.shallow_calls.load(Ordering::SeqCst);
        let deep = probe.deep_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.shallow_calls.load(Ordering::SeqCst), shallow);
        assert_eq!(probe.deep_calls.load(Ordering::SeqCst), deep);
    }

    #[tokio::test]
    async fn test_cancel_stops_monitoring_promptly() {
        let probe = Scripted::new(usize::MAX, usize::MAX);
        let monitor = OutageMonitor::new(probe, MonitorSettings {
            fast_interval: Duration::from_secs(30),
            deep_rearm: Duration::from_secs(30),
        });
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = monitor.watch("http://x/live", &cancel).await;
        assert_eq!(result, WatchResult::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_up_stream_still_waits_one_interval() {
        let probe = Scripted::new(0, 0);
        let monitor = OutageMonitor::new(probe.clone(), MonitorSettings {
            fast_interval: Duration::from_millis(200),
            deep_rearm: Duration::from_millis(10),
        });

        let started = Instant::now();
        let result = monitor.watch("http://x/live", &CancellationToken::new()).await;

        assert_eq!(result, WatchResult::Resumed);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_cancel_during_initial_wait_skips_probing() {
        let probe = Scripted::new(0, 0);
        let monitor = OutageMonitor::new(probe.clone(), MonitorSettings {
            fast_interval: Duration::from_secs(30),
            deep_rearm: Duration::from_secs(30),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = monitor.watch("http://x/live", &cancel).await;

        assert_eq!(result, WatchResult::Cancelled);
        assert_eq!(probe.shallow_calls.load(Ordering::SeqCst), 0);
        assert_eq!(probe.deep_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_claim_is_single_shot() {
        let active = AtomicBool::new(true);
        assert!(claim(&active));
        assert!(!claim(&active));
    }

    #[test]
    fn test_availability_state_counters() {
        let mut state = AvailabilityState::default();
        state.record_failure();
        state.record_failure();
        assert_eq!(state.consecutive_failures, 2);
        assert!(!state.available);

        state.record_success();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.available);
    }
}
