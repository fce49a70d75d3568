//! Session and segment bookkeeping
//!
//! A [`Session`] is owned by the orchestrator for the lifetime of one
//! recording request. Only the orchestrator mutates it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Phase of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingPhase {
    /// No session running.
    Idle,
    /// A capture subprocess is writing a segment.
    Capturing,
    /// The stream is down and the outage monitor is polling.
    Monitoring,
    /// Target duration reached; segments are being joined.
    Merging,
    /// The final file has been produced.
    Done,
    /// The session was stopped by the caller.
    Stopped,
    /// The merge stage failed or no segment was ever recorded.
    Failed,
}

impl Default for RecordingPhase {
    fn default() -> Self {
        Self::Idle
    }
}

impl RecordingPhase {
    /// Whether the session has reached an end state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordingPhase::Done | RecordingPhase::Stopped | RecordingPhase::Failed
        )
    }
}

impl std::fmt::Display for RecordingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingPhase::Idle => write!(f, "idle"),
            RecordingPhase::Capturing => write!(f, "capturing"),
            RecordingPhase::Monitoring => write!(f, "monitoring"),
            RecordingPhase::Merging => write!(f, "merging"),
            RecordingPhase::Done => write!(f, "done"),
            RecordingPhase::Stopped => write!(f, "stopped"),
            RecordingPhase::Failed => write!(f, "failed"),
        }
    }
}

/// One continuously captured file.
///
/// Only completed captures become segments; a failed attempt is discarded
/// before anything is stored, keeping just its spent index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Attempt index, assigned at creation and never reused.
    pub index: u32,
    pub path: PathBuf,
    pub duration_ms: u64,
}

/// State for one end-to-end recording request.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub url: String,
    pub work_dir: PathBuf,
    pub target_ms: u64,
    pub accumulated_ms: u64,
    pub segments: Vec<Segment>,
    pub phase: RecordingPhase,
    /// Absolute or relative path of the merged result.
    pub final_path: PathBuf,
    extension: String,
    next_index: u32,
}

impl Session {
    pub fn new(
        url: String,
        work_dir: PathBuf,
        target_ms: u64,
        final_path: PathBuf,
        extension: &str,
    ) -> Self {
        Self {
            id: new_session_id(),
            url,
            work_dir,
            target_ms,
            accumulated_ms: 0,
            segments: Vec::new(),
            phase: RecordingPhase::Idle,
            final_path,
            extension: extension.to_string(),
            next_index: 0,
        }
    }

    /// Milliseconds still to record; zero once the target is met.
    pub fn remaining_ms(&self) -> u64 {
        remaining_ms(self.target_ms, self.accumulated_ms)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining_ms() == 0
    }

    /// Reserve the next attempt index and its destination path.
    ///
    /// Indices count attempts: a failed attempt consumes its index.
    pub fn begin_attempt(&mut self) -> (u32, PathBuf) {
        let index = self.next_index;
        self.next_index += 1;
        (index, self.segment_path(index))
    }

    /// Record a successful capture.
    pub fn record_segment(&mut self, index: u32, path: PathBuf, duration_ms: u64) {
        self.accumulated_ms = self.accumulated_ms.saturating_add(duration_ms);
        self.segments.push(Segment {
            index,
            path,
            duration_ms,
        });
    }

    pub fn segment_path(&self, index: u32) -> PathBuf {
        self.work_dir
            .join(format!("{}_part{:03}.{}", self.id, index, self.extension))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}_concat.txt", self.id))
    }

    /// Recorded progress towards the target, in percent (capped at 100).
    pub fn progress_percent(&self, in_flight_ms: u64) -> f32 {
        progress_percent(self.target_ms, self.accumulated_ms.saturating_add(in_flight_ms))
    }
}

/// `max(0, target - accumulated)`
pub fn remaining_ms(target_ms: u64, accumulated_ms: u64) -> u64 {
    target_ms.saturating_sub(accumulated_ms)
}

/// Seconds to request from the next capture, rounded up so a sub-second
/// remainder is still recorded. Zero means the session is complete.
pub fn requested_secs(remaining_ms: u64) -> u64 {
    remaining_ms.div_ceil(1000)
}

pub fn progress_percent(target_ms: u64, recorded_ms: u64) -> f32 {
    if target_ms == 0 {
        return 100.0;
    }
    ((recorded_ms as f64 / target_ms as f64) * 100.0).min(100.0) as f32
}

/// Resolve the final output path, appending the container extension when
/// the requested name has none.
pub fn final_output_path(directory: &Path, final_name: &str, extension: &str) -> PathBuf {
    let path = directory.join(final_name);
    if path.extension().is_some() {
        path
    } else {
        path.with_extension(extension)
    }
}

/// Time-based session id with a short random suffix.
fn new_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", millis, &suffix[..8])
}
