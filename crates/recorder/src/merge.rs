//! Segment merging
//!
//! Joins the retained segments of a session into the final file. A single
//! segment is moved into place untouched; several are joined with ffmpeg's
//! concat demuxer in stream-copy mode.
//!
//! Inputs are only deleted after a successful join, so a failed merge can
//! be redone by hand from the segments and manifest left in the work dir.

use crate::session::Segment;
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Errors that can occur while producing the final file.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Nothing was recorded.
    #[error("no segments to merge")]
    EmptyInput,

    #[error("failed to write concat manifest {path}: {source}")]
    ManifestWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start concatenation: {0}")]
    ConcatSpawn(io::Error),

    #[error("concatenation exited with code {code:?}: {stderr}")]
    ConcatFailed { code: Option<i32>, stderr: String },

    #[error("failed to move segment into place: {0}")]
    Rename(io::Error),
}

/// Joins same-codec files listed in a manifest into one output.
#[async_trait]
pub trait Concatenator: Send + Sync {
    async fn concat(&self, manifest: &Path, output: &Path) -> Result<(), MergeError>;
}

/// Build the ffmpeg concat-demuxer command.
pub fn build_concat_command(ffmpeg_path: &str, manifest: &Path, output: &Path) -> Command {
    let mut cmd = Command::new(ffmpeg_path);
    cmd.args(["-hide_banner", "-nostdin", "-y"]);
    cmd.args(["-loglevel", "error"]);
    cmd.args(["-f", "concat", "-safe", "0"]);
    cmd.arg("-i").arg(manifest);
    cmd.args(["-c", "copy"]);
    cmd.arg(output);
    cmd
}

/// Production concatenator backed by ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegConcat {
    ffmpeg_path: String,
}

impl FfmpegConcat {
    pub fn new(ffmpeg_path: &str) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_string(),
        }
    }
}

#[async_trait]
impl Concatenator for FfmpegConcat {
    async fn concat(&self, manifest: &Path, output: &Path) -> Result<(), MergeError> {
        let output = build_concat_command(&self.ffmpeg_path, manifest, output)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(MergeError::ConcatSpawn)?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(MergeError::ConcatFailed {
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

/// Quote a path for a concat manifest line.
fn quote_manifest_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "'\\''")
}

/// Render manifest text, one `file '<path>'` line per input in order.
pub fn render_manifest(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("file '{}'\n", quote_manifest_path(p)))
        .collect()
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Rename, falling back to copy + remove across filesystems.
///
/// Once the copy has landed the move counts as done; a source that cannot
/// be removed is only logged.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            if let Err(e) = fs::remove_file(from) {
                warn!(path = %from.display(), error = %e, "could not remove moved segment");
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

pub struct SegmentMerger {
    concat: std::sync::Arc<dyn Concatenator>,
}

impl SegmentMerger {
    pub fn new(concat: std::sync::Arc<dyn Concatenator>) -> Self {
        Self { concat }
    }

    /// Produce `final_path` from `segments`, ordered by capture index.
    ///
    /// `manifest_path` is only written when there are two or more segments.
    pub async fn merge(
        &self,
        mut segments: Vec<Segment>,
        manifest_path: &Path,
        final_path: &Path,
    ) -> Result<PathBuf, MergeError> {
        if segments.is_empty() {
            return Err(MergeError::EmptyInput);
        }
        segments.sort_by_key(|s| s.index);

        ensure_parent(final_path).map_err(MergeError::Rename)?;

        if let [only] = segments.as_slice() {
            move_file(&only.path, final_path).map_err(MergeError::Rename)?;
            info!(final_path = %final_path.display(), "single segment moved into place");
            return Ok(final_path.to_path_buf());
        }

        let paths = segments
            .iter()
            .map(|s| absolute(&s.path))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|source| MergeError::ManifestWrite {
                path: manifest_path.to_path_buf(),
                source,
            })?;

        fs::write(manifest_path, render_manifest(&paths)).map_err(|source| {
            MergeError::ManifestWrite {
                path: manifest_path.to_path_buf(),
                source,
            }
        })?;

        info!(
            segments = paths.len(),
            final_path = %final_path.display(),
            "concatenating segments"
        );
        self.concat.concat(manifest_path, final_path).await?;

        for path in paths.iter().map(PathBuf::as_path).chain([manifest_path]) {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "could not remove merged input");
            }
        }

        Ok(final_path.to_path_buf())
    }
}
