//! Recording orchestrator
//!
//! Drives one session through `Idle → Capturing ⇄ Monitoring → Merging → Done`,
//! with `Stopped` reachable from any phase on [`Recorder::stop`]. Exactly one
//! worker (a capture or the outage monitor) is active at a time.

use crate::capture::{CaptureOutcome, CaptureRequest, FfmpegCapture, SegmentCapture};
use crate::config::Config;
use crate::merge::{Concatenator, FfmpegConcat, MergeError, SegmentMerger};
use crate::monitor::{MonitorSettings, OutageMonitor, WatchResult};
use crate::probe::{HttpStreamProbe, StreamProbe};
use crate::session::{final_output_path, requested_secs, RecordingPhase, Session};
use crate::status::{new_shared_progress, SessionProgress, SharedProgress, StatusSnapshot};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Caller-visible failures of a recording session.
#[derive(Debug, Error)]
pub enum RecordingError {
    /// Not a single segment was captured.
    #[error("no segment was recorded; the stream was never reachable")]
    EmptyInput,

    /// Segments were recorded but could not be joined. They are left on disk.
    #[error("merge failed: {0}")]
    MergeFailed(#[source] MergeError),

    #[error("recording was stopped before completion")]
    Stopped,

    #[error("a recording is already in progress")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MergeError> for RecordingError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::EmptyInput => RecordingError::EmptyInput,
            other => RecordingError::MergeFailed(other),
        }
    }
}

/// Filesystem layout and polling cadence for a [`Recorder`].
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub extension: String,
    pub monitor: MonitorSettings,
}

impl RecorderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_dir: config.output.directory.clone(),
            work_dir: config.output.resolved_work_dir(),
            extension: config.capture.container_extension.clone(),
            monitor: MonitorSettings::from_config(&config.probe),
        }
    }
}

/// Releases the recorder's session slot when a run ends or is dropped.
struct ActiveSession<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

/// Records a live stream to a fixed-length file, riding out outages.
pub struct Recorder {
    url: String,
    settings: RecorderSettings,
    probe: Arc<dyn StreamProbe>,
    capture: Arc<dyn SegmentCapture>,
    monitor: OutageMonitor,
    merger: SegmentMerger,
    progress: SharedProgress,
    active: Mutex<Option<CancellationToken>>,
}

impl Recorder {
    /// Recorder wired to ffmpeg, ffprobe and HTTP probing.
    pub fn new(config: &Config, url: impl Into<String>) -> Self {
        Self::with_backends(
            RecorderSettings::from_config(config),
            url,
            Arc::new(HttpStreamProbe::new(&config.probe)),
            Arc::new(FfmpegCapture::new(&config.capture)),
            Arc::new(FfmpegConcat::new(&config.capture.ffmpeg_path)),
        )
    }

    /// Recorder with explicit probe, capture and concatenation backends.
    pub fn with_backends(
        settings: RecorderSettings,
        url: impl Into<String>,
        probe: Arc<dyn StreamProbe>,
        capture: Arc<dyn SegmentCapture>,
        concat: Arc<dyn Concatenator>,
    ) -> Self {
        let monitor = OutageMonitor::new(probe.clone(), settings.monitor.clone());
        Self {
            url: url.into(),
            settings,
            probe,
            capture,
            monitor,
            merger: SegmentMerger::new(concat),
            progress: new_shared_progress(),
            active: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Record `target_minutes` of the stream into `final_name`.
    pub async fn start_recording(
        &self,
        target_minutes: u32,
        final_name: &str,
    ) -> Result<PathBuf, RecordingError> {
        let target = Duration::from_secs(u64::from(target_minutes) * 60);
        self.record_for(target, final_name).await
    }

    /// Record `target` worth of stream into `final_name`.
    ///
    /// Resolves to the merged file's path once the target is reached.
    pub async fn record_for(
        &self,
        target: Duration,
        final_name: &str,
    ) -> Result<PathBuf, RecordingError> {
        let (cancel, _active) = self.claim()?;
        self.run_session(target, final_name, &cancel).await
    }

    /// Stop the running session, if any. Safe to call repeatedly and from any state.
    ///
    /// Returns immediately; the session winds down on its own task.
    pub fn stop(&self) {
        let slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = slot.as_ref() {
            if !token.is_cancelled() {
                info!("stop requested");
                token.cancel();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Current status snapshot.
    pub async fn status(&self) -> StatusSnapshot {
        let progress = self.progress.read().await.clone();
        let availability = self.monitor.state().read().await.clone();
        StatusSnapshot::from_parts(&progress, &availability)
    }

    fn claim(&self) -> Result<(CancellationToken, ActiveSession<'_>), RecordingError> {
        let mut slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(RecordingError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Ok((token, ActiveSession { slot: &self.active }))
    }

    async fn publish(&self, session: &Session, in_flight_ms: Option<Arc<AtomicU64>>) {
        *self.progress.write().await = SessionProgress {
            session_id: Some(session.id.clone()),
            phase: session.phase,
            accumulated_ms: session.accumulated_ms,
            target_ms: session.target_ms,
            segments_recorded: session.segments.len(),
            in_flight_ms,
        };
    }

    async fn set_phase(&self, session: &mut Session, phase: RecordingPhase) {
        session.phase = phase;
        let mut progress = self.progress.write().await;
        progress.phase = phase;
        progress.in_flight_ms = None;
    }

    async fn run_session(
        &self,
        target: Duration,
        final_name: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RecordingError> {
        std::fs::create_dir_all(&self.settings.work_dir)?;
        std::fs::create_dir_all(&self.settings.output_dir)?;

        let mut session = Session::new(
            self.url.clone(),
            self.settings.work_dir.clone(),
            target.as_millis() as u64,
            final_output_path(&self.settings.output_dir, final_name, &self.settings.extension),
            &self.settings.extension,
        );
        self.publish(&session, None).await;
        info!(
            session_id = %session.id,
            url = %session.url,
            target_ms = session.target_ms,
            final_path = %session.final_path.display(),
            "recording started"
        );

        let initial = tokio::select! {
            _ = cancel.cancelled() => None,
            up = self.probe.shallow(&session.url) => Some(up),
        };
        let Some(available) = initial else {
            return self.finish_stopped(&mut session).await;
        };

        let mut next = if available {
            self.monitor.record_available().await;
            RecordingPhase::Capturing
        } else {
            self.monitor.record_unavailable().await;
            info!(session_id = %session.id, "stream unavailable at start");
            RecordingPhase::Monitoring
        };

        while !session.is_complete() {
            if cancel.is_cancelled() {
                return self.finish_stopped(&mut session).await;
            }

            match next {
                RecordingPhase::Monitoring => {
                    session.phase = RecordingPhase::Monitoring;
                    self.publish(&session, None).await;
                    match self.monitor.watch(&session.url, cancel).await {
                        WatchResult::Resumed => next = RecordingPhase::Capturing,
                        WatchResult::Cancelled => return self.finish_stopped(&mut session).await,
                    }
                }
                _ => {
                    let (index, dest) = session.begin_attempt();
                    let request = CaptureRequest::new(
                        &session.url,
                        requested_secs(session.remaining_ms()),
                        dest,
                    );
                    session.phase = RecordingPhase::Capturing;
                    self.publish(&session, Some(request.progress_ms.clone())).await;
                    info!(
                        session_id = %session.id,
                        index,
                        requested_secs = request.duration_secs,
                        "capturing segment"
                    );

                    match self.capture.run(request, cancel.clone()).await {
                        CaptureOutcome::Success { duration_ms, path } => {
                            session.record_segment(index, path, duration_ms);
                            self.monitor.record_available().await;
                            info!(
                                session_id = %session.id,
                                index,
                                duration_ms,
                                accumulated_ms = session.accumulated_ms,
                                target_ms = session.target_ms,
                                "segment recorded"
                            );
                            self.publish(&session, None).await;
                        }
                        CaptureOutcome::Failure(reason) => {
                            warn!(session_id = %session.id, index, %reason, "segment discarded");
                            self.monitor.record_unavailable().await;
                            next = RecordingPhase::Monitoring;
                        }
                        CaptureOutcome::Stopped { path } => {
                            if let Some(path) = path {
                                info!(path = %path.display(), "partial segment left on disk");
                            }
                            return self.finish_stopped(&mut session).await;
                        }
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return self.finish_stopped(&mut session).await;
        }

        self.set_phase(&mut session, RecordingPhase::Merging).await;
        let manifest = session.manifest_path();
        let segments = std::mem::take(&mut session.segments);
        info!(
            session_id = %session.id,
            segments = segments.len(),
            accumulated_ms = session.accumulated_ms,
            "target reached, merging"
        );

        match self.merger.merge(segments, &manifest, &session.final_path).await {
            Ok(path) => {
                self.set_phase(&mut session, RecordingPhase::Done).await;
                info!(session_id = %session.id, path = %path.display(), "recording complete");
                Ok(path)
            }
            Err(e) => {
                self.set_phase(&mut session, RecordingPhase::Failed).await;
                warn!(session_id = %session.id, error = %e, "merge stage failed");
                Err(e.into())
            }
        }
    }

    async fn finish_stopped(&self, session: &mut Session) -> Result<PathBuf, RecordingError> {
        self.set_phase(session, RecordingPhase::Stopped).await;
        info!(
            session_id = %session.id,
            segments = session.segments.len(),
            accumulated_ms = session.accumulated_ms,
            "recording stopped; segments kept, no merge"
        );
        Err(RecordingError::Stopped)
    }
}
