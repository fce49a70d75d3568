//! Status reporting for the recorder
//!
//! The orchestrator publishes [`SessionProgress`] at every transition;
//! [`StatusSnapshot`] combines it with the outage monitor's availability
//! state for callers and the HTTP endpoint.

use crate::monitor::AvailabilityState;
use crate::session::{progress_percent as percent_of, RecordingPhase};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Orchestrator-side view of the current session.
#[derive(Debug, Clone, Default)]
pub struct SessionProgress {
    pub session_id: Option<String>,
    pub phase: RecordingPhase,
    pub accumulated_ms: u64,
    pub target_ms: u64,
    pub segments_recorded: usize,
    /// Progress counter of the capture currently running, if any.
    pub in_flight_ms: Option<Arc<AtomicU64>>,
}

pub type SharedProgress = Arc<RwLock<SessionProgress>>;

pub fn new_shared_progress() -> SharedProgress {
    Arc::new(RwLock::new(SessionProgress::default()))
}

/// Point-in-time status of the recorder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub session_id: Option<String>,
    pub phase: RecordingPhase,
    pub progress_percent: f32,
    pub segments_recorded: usize,
    pub stream_available: bool,
    pub consecutive_failures: u32,
    pub accumulated_ms: u64,
    pub target_ms: u64,
    pub last_available_unix_ms: Option<i64>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::from_parts(&SessionProgress::default(), &AvailabilityState::default())
    }
}

impl StatusSnapshot {
    pub fn from_parts(progress: &SessionProgress, availability: &AvailabilityState) -> Self {
        let in_flight = match (&progress.in_flight_ms, progress.phase) {
            (Some(counter), RecordingPhase::Capturing) => counter.load(Ordering::Relaxed),
            _ => 0,
        };

        let progress_percent = match progress.phase {
            RecordingPhase::Idle if progress.session_id.is_none() => 0.0,
            RecordingPhase::Done => 100.0,
            _ => percent_of(
                progress.target_ms,
                progress.accumulated_ms.saturating_add(in_flight),
            ),
        };

        Self {
            session_id: progress.session_id.clone(),
            phase: progress.phase,
            progress_percent,
            segments_recorded: progress.segments_recorded,
            stream_available: availability.available,
            consecutive_failures: availability.consecutive_failures,
            accumulated_ms: progress.accumulated_ms,
            target_ms: progress.target_ms,
            last_available_unix_ms: availability.last_available_unix_ms,
        }
    }
}
