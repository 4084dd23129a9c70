//! Video stream metadata via ffprobe.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use super::error::{MediaError, MediaResult};

/// Frame rate assumed when the container does not report one.
pub const DEFAULT_FPS: f64 = 25.0;

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: u64,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe the first video stream of `video`.
pub async fn probe_video(ffprobe: &str, video: &Path, timeout: Duration) -> MediaResult<VideoInfo> {
    let child = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,nb_frames:format=duration",
            "-of",
            "json",
        ])
        .arg(video)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MediaError::ToolNotFound(ffprobe.to_string()),
            _ => MediaError::Io(e),
        })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| MediaError::Timeout(timeout.as_secs()))??;

    if !output.status.success() {
        return Err(MediaError::ProbeFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(stdout: &[u8]) -> MediaResult<VideoInfo> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| MediaError::ProbeFailed("no video stream".to_string()))?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(MediaError::ProbeFailed(format!(
            "video stream has no usable dimensions ({}x{})",
            width, height
        )));
    }

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rational)
        .filter(|fps| *fps > 0.0)
        .unwrap_or(DEFAULT_FPS);

    let counted = stream.nb_frames.as_deref().and_then(|n| n.parse::<u64>().ok());
    let total_frames = match counted {
        Some(n) if n > 0 => n,
        _ => {
            let duration = parsed
                .format
                .and_then(|f| f.duration)
                .and_then(|d| d.parse::<f64>().ok())
                .unwrap_or(0.0);
            (duration * fps).round() as u64
        }
    };

    Ok(VideoInfo {
        width,
        height,
        fps,
        total_frames,
    })
}

/// Parse ffprobe's "num/den" rate notation.
fn parse_rational(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => value.trim().parse().ok(),
    }
}
