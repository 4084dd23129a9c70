//! Error types for frame decoding and codec tooling.

use std::path::PathBuf;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("ffmpeg failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    #[error("Frame extraction timed out after {0} seconds")]
    Timeout(u64),

    #[error("Video file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to decode frame {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Native decoder error: {0}")]
    Native(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
