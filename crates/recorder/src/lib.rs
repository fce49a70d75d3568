//! Stream Recorder
//!
//! Records a live network stream to a single file of a requested length,
//! capturing in segments across outages and joining them at the end.

pub mod capture;
pub mod merge;
pub mod monitor;
pub mod orchestrator;
pub mod probe;
pub mod session;
pub mod startup;
pub mod status;
pub mod status_server;

pub use stream_recorder_config as config;
pub use stream_recorder_config::Config;
pub use capture::{
    build_capture_command, classify_exit, CaptureError, CaptureOutcome, CaptureRequest,
    FfmpegCapture, SegmentCapture,
};
pub use merge::{build_concat_command, Concatenator, FfmpegConcat, MergeError, SegmentMerger};
pub use monitor::{AvailabilityState, MonitorSettings, OutageMonitor, WatchResult};
pub use orchestrator::{Recorder, RecorderSettings, RecordingError};
pub use probe::{build_probe_command, HttpStreamProbe, StreamProbe};
pub use session::{RecordingPhase, Segment, Session};
pub use startup::{check_tool_available, parse_tool_version, run_startup_checks, StartupError};
pub use status::StatusSnapshot;
pub use status_server::{create_status_router, run_status_server, ServerError};
