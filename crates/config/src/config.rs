//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Settings for the ffmpeg capture subprocess
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    /// Path or name of the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// A capture that exits before this many seconds is a failure
    #[serde(default = "default_min_viable_secs")]
    pub min_viable_secs: u64,
    /// Upper bound on ffmpeg's delay between reconnect attempts
    #[serde(default = "default_reconnect_delay_max_secs")]
    pub reconnect_delay_max_secs: u64,
    /// How long a stopped capture may take to exit after SIGTERM
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Container extension for segments and the final file
    #[serde(default = "default_container_extension")]
    pub container_extension: String,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_min_viable_secs() -> u64 {
    5
}

fn default_reconnect_delay_max_secs() -> u64 {
    5
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_container_extension() -> String {
    "ts".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            min_viable_secs: default_min_viable_secs(),
            reconnect_delay_max_secs: default_reconnect_delay_max_secs(),
            stop_grace_ms: default_stop_grace_ms(),
            container_extension: default_container_extension(),
        }
    }
}

/// Availability probing cadence and timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Path or name of the ffprobe binary
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Per-probe timeout
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Interval of the fast (HEAD) polling loop
    #[serde(default = "default_fast_interval_ms")]
    pub fast_interval_ms: u64,
    /// Delay before the deep probe is resubmitted after it completes
    #[serde(default = "default_deep_rearm_ms")]
    pub deep_rearm_ms: u64,
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_fast_interval_ms() -> u64 {
    2000
}

fn default_deep_rearm_ms() -> u64 {
    1000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            timeout_ms: default_probe_timeout_ms(),
            fast_interval_ms: default_fast_interval_ms(),
            deep_rearm_ms: default_deep_rearm_ms(),
        }
    }
}

/// Where segments and final recordings are written
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Directory receiving the final merged recording
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    /// Directory for transient segment and manifest files
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("recordings")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            work_dir: None,
        }
    }
}

impl OutputConfig {
    /// Working directory, falling back to `<directory>/.segments`
    pub fn resolved_work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.directory.join(".segments"))
    }
}

/// Status HTTP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_status_bind_addr")]
    pub bind_addr: String,
}

fn default_status_enabled() -> bool {
    true
}

fn default_status_bind_addr() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            bind_addr: default_status_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RECORDER_FFMPEG_PATH -> capture.ffmpeg_path
    /// - RECORDER_MIN_VIABLE_SECS -> capture.min_viable_secs
    /// - RECORDER_FFPROBE_PATH -> probe.ffprobe_path
    /// - RECORDER_PROBE_TIMEOUT_MS -> probe.timeout_ms
    /// - RECORDER_OUTPUT_DIR -> output.directory
    /// - RECORDER_STATUS_ENABLED -> status.enabled
    /// - RECORDER_STATUS_ADDR -> status.bind_addr
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RECORDER_FFMPEG_PATH") {
            if !val.is_empty() {
                self.capture.ffmpeg_path = val;
            }
        }

        if let Ok(val) = env::var("RECORDER_MIN_VIABLE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.capture.min_viable_secs = secs;
            }
        }

        if let Ok(val) = env::var("RECORDER_FFPROBE_PATH") {
            if !val.is_empty() {
                self.probe.ffprobe_path = val;
            }
        }

        if let Ok(val) = env::var("RECORDER_PROBE_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.probe.timeout_ms = ms;
            }
        }

        if let Ok(val) = env::var("RECORDER_OUTPUT_DIR") {
            if !val.is_empty() {
                self.output.directory = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RECORDER_STATUS_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.status.enabled = true,
                "false" | "0" | "no" => self.status.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("RECORDER_STATUS_ADDR") {
            if !val.is_empty() {
                self.status.bind_addr = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if !path.as_ref().exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            return Ok(config);
        }
        Self::load(path)
    }
}
