//! Frame extraction through the ffmpeg command-line tool.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use image::DynamicImage;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::error::{MediaError, MediaResult};

/// Prefix of files written by [`Ffmpeg::extract_frames`].
const FRAME_PREFIX: &str = "frame_";

/// Handle on an ffmpeg binary with a per-invocation timeout.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: String,
    timeout: Duration,
}

impl Ffmpeg {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Whether the binary resolves on PATH (or as a given path).
    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    pub fn ensure_available(&self) -> MediaResult<PathBuf> {
        which::which(&self.binary).map_err(|_| MediaError::ToolNotFound(self.binary.clone()))
    }

    /// Sample `fps` frames per second of `video` into `output_dir` as JPEGs.
    ///
    /// Returns the written files in frame order.
    pub async fn extract_frames(
        &self,
        video: &Path,
        fps: u32,
        output_dir: &Path,
    ) -> MediaResult<Vec<PathBuf>> {
        let pattern = output_dir.join(format!("{}%06d.jpg", FRAME_PREFIX));

        info!(
            video = %video.display(),
            output_dir = %output_dir.display(),
            fps,
            "Extracting frames with ffmpeg"
        );

        let start = Instant::now();
        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            video.to_string_lossy().into_owned(),
            "-vf".to_string(),
            format!("fps={}", fps),
            "-q:v".to_string(),
            "2".to_string(),
            pattern.to_string_lossy().into_owned(),
        ];
        self.run(&args).await?;

        let frames = list_frames(output_dir).await?;

        info!(
            frames_extracted = frames.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            fps,
            "Frame extraction complete"
        );

        Ok(frames)
    }

    /// Decode the single frame at `seconds` into memory.
    ///
    /// The frame round-trips through a temporary JPEG that is removed once loaded.
    pub async fn extract_frame_at(&self, video: &Path, seconds: f64) -> MediaResult<DynamicImage> {
        let temp = tempfile::Builder::new()
            .prefix("anpr_frame_")
            .suffix(".jpg")
            .tempfile()?
            .into_temp_path();

        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-ss".to_string(),
            format!("{:.3}", seconds),
            "-i".to_string(),
            video.to_string_lossy().into_owned(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            temp.to_string_lossy().into_owned(),
        ];
        self.run(&args).await?;

        let frame = load_frame(&temp).await;
        if let Err(e) = temp.close() {
            debug!(error = %e, "Failed to remove temporary frame file");
        }
        frame
    }

    async fn run(&self, args: &[String]) -> MediaResult<()> {
        debug!(binary = %self.binary, args = ?args, "Running ffmpeg");

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MediaError::ToolNotFound(self.binary.clone()),
                _ => MediaError::Io(e),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                error!(timeout_s = self.timeout.as_secs(), "ffmpeg timed out");
                return Err(MediaError::Timeout(self.timeout.as_secs()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                exit_code = ?output.status.code(),
                stderr = %stderr,
                "ffmpeg exited with failure"
            );
            return Err(MediaError::FfmpegFailed {
                message: format!("exit status {}", output.status),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            });
        }

        Ok(())
    }
}

/// Frame files in `dir`, sorted by their sequence number.
pub async fn list_frames(dir: &Path) -> MediaResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut frames = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_frame = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(FRAME_PREFIX) && n.ends_with(".jpg"))
            .unwrap_or(false);
        if is_frame {
            frames.push(path);
        }
    }

    // Zero-padded names sort in frame order
    frames.sort();
    Ok(frames)
}

/// Decode an image file off the async runtime.
pub async fn load_frame(path: &Path) -> MediaResult<DynamicImage> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        image::open(&owned).map_err(|source| MediaError::Decode { path: owned, source })
    })
    .await
    .map_err(|e| MediaError::Native(format!("frame decode task failed: {}", e)))?
}
