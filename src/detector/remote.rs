use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_stream::try_stream;
use chrono::Utc;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::{BackendError, BackendKind, DetectionStream, DetectorConfig, DetectorError, PlateDetector};
use crate::media::Ffmpeg;
use crate::models::detection::{BBox, RawDetection};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delegates detection to an HTTP inference service, one frame batch at a time.
pub struct RemoteDetector {
    http: Client,
    base_url: String,
    token: Option<String>,
    batch_size: usize,
    fps: u32,
    ffmpeg: Ffmpeg,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    detections_by_frame: Option<BTreeMap<u32, Vec<RemotePlate>>>,
}

#[derive(Debug, Deserialize)]
struct RemotePlate {
    #[serde(default)]
    plate: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    bbox: Option<RemoteBox>,
    normalized_plate: Option<String>,
}

/// The service reports boxes either as an object or as `[x1, y1, x2, y2]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemoteBox {
    Corners { x1: f64, y1: f64, x2: f64, y2: f64 },
    Array([f64; 4]),
}

impl From<RemoteBox> for BBox {
    fn from(value: RemoteBox) -> Self {
        let [x1, y1, x2, y2] = match value {
            RemoteBox::Corners { x1, y1, x2, y2 } => [x1, y1, x2, y2],
            RemoteBox::Array(corners) => corners,
        };
        BBox::new(
            x1.round() as i32,
            y1.round() as i32,
            x2.round() as i32,
            y2.round() as i32,
        )
    }
}

impl RemoteDetector {
    /// Build the client and verify `GET {url}/health` answers 200 within 3s.
    pub async fn connect(config: &DetectorConfig) -> Result<Self, BackendError> {
        let base_url = config
            .remote_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                BackendError::unavailable(BackendKind::Remote, "REMOTE_INFERENCE_URL is not set")
            })?;

        info!(
            url = %base_url,
            auth_configured = config.remote_token.is_some(),
            batch_size = config.remote_batch_size,
            timeout_s = config.remote_timeout.as_secs(),
            fps = config.fps,
            "Remote detector initializing"
        );

        verify_health(&base_url).await?;

        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.remote_timeout)
            .build()
            .map_err(|e| BackendError::unavailable(BackendKind::Remote, e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            token: config.remote_token.clone(),
            batch_size: config.remote_batch_size.max(1),
            fps: config.fps,
            ffmpeg: Ffmpeg::new(config.ffmpeg_path.clone(), config.extraction_timeout),
        })
    }

    async fn send_batch(
        &self,
        frames: &[PathBuf],
        batch_index: usize,
        camera_id: &str,
    ) -> Result<BTreeMap<u32, Vec<RemotePlate>>, DetectorError> {
        let endpoint = format!("{}/infer/frames", self.base_url);
        info!(batch_index, batch_size = frames.len(), camera_id, "Remote frame batch start");

        let mut form = Form::new().text("camera_id", camera_id.to_string());
        for path in frames {
            let bytes = tokio::fs::read(path).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "frame.jpg".to_string());
            let part = Part::bytes(bytes).file_name(name).mime_str("image/jpeg")?;
            form = form.part("files", part);
        }

        let mut request = self.http.post(&endpoint).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let start = Instant::now();
        let response = request.send().await.map_err(|e| {
            error!(batch_index, error = %e, timeout = e.is_timeout(), "Remote frame batch request failed");
            DetectorError::Http(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body: String = response.text().await.unwrap_or_default().chars().take(200).collect();
            error!(batch_index, status = status.as_u16(), body = %body, "Remote frame batch rejected");
            return Err(DetectorError::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let detections = parse_batch_response(&body)?;

        info!(
            batch_index,
            elapsed_ms = start.elapsed().as_millis() as u64,
            frames_processed = detections.len(),
            detections_returned = detections.values().map(Vec::len).sum::<usize>(),
            "Remote frame batch done"
        );
        Ok(detections)
    }
}

async fn verify_health(base_url: &str) -> Result<(), BackendError> {
    let url = format!("{}/health", base_url);
    let unavailable = |reason: String| BackendError::unavailable(BackendKind::Remote, reason);

    let client = Client::builder()
        .timeout(HEALTH_TIMEOUT)
        .build()
        .map_err(|e| unavailable(e.to_string()))?;

    let start = Instant::now();
    let response = client.get(&url).send().await.map_err(|e| {
        warn!(url = %url, error = %e, "Remote health check failed");
        if e.is_timeout() {
            unavailable(format!("health check timed out after 3s: {}", url))
        } else {
            unavailable(format!("not reachable: {}: {}", url, e))
        }
    })?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let body: String = response.text().await.unwrap_or_default().chars().take(200).collect();
        warn!(url = %url, status = status.as_u16(), body = %body, "Remote health check rejected");
        return Err(unavailable(format!("health check returned {}: {}", status.as_u16(), body)));
    }

    info!(url = %url, elapsed_ms = start.elapsed().as_millis() as u64, "Remote health check ok");
    Ok(())
}

fn parse_batch_response(body: &[u8]) -> Result<BTreeMap<u32, Vec<RemotePlate>>, DetectorError> {
    let parsed: BatchResponse = serde_json::from_slice(body)
        .map_err(|e| DetectorError::InvalidResponse(e.to_string()))?;
    parsed.detections_by_frame.ok_or_else(|| {
        DetectorError::InvalidResponse("response missing 'detections_by_frame'".to_string())
    })
}

impl PlateDetector for RemoteDetector {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn detect<'a>(&'a self, video: &'a Path, camera_id: Option<&'a str>) -> DetectionStream<'a> {
        try_stream! {
            if !video.exists() {
                error!(video = %video.display(), "Video file not found");
                Err::<(), _>(crate::media::MediaError::FileNotFound(video.to_path_buf()))?;
            }

            let camera = camera_id.unwrap_or("unknown");
            let overall = Instant::now();
            info!(video = %video.display(), camera_id = camera, fps = self.fps, batch_size = self.batch_size, "Remote inference start");

            // Dropped with the stream, removing extracted frames
            let workdir = tempfile::Builder::new().prefix("anpr_frames_").tempdir()?;
            let frames = self.ffmpeg.extract_frames(video, self.fps, workdir.path()).await?;

            if frames.is_empty() {
                warn!(video = %video.display(), "No frames extracted");
            }

            let mut total = 0usize;
            for (batch_index, batch) in frames.chunks(self.batch_size).enumerate() {
                let offset = (batch_index * self.batch_size) as u64;
                let by_frame = self.send_batch(batch, batch_index, camera).await?;

                for (frame_idx, plates) in by_frame {
                    for plate in plates {
                        total += 1;
                        let bbox = match plate.bbox {
                            Some(bbox) => bbox.into(),
                            None => {
                                warn!(batch_index, frame_idx, plate = %plate.plate, "Remote detection has no bbox");
                                BBox::default()
                            }
                        };
                        yield RawDetection {
                            plate_text: plate.plate,
                            normalized_plate: plate.normalized_plate,
                            confidence: plate.confidence,
                            bbox,
                            frame_no: offset + frame_idx as u64,
                            crop: None,
                            frame: None,
                            camera_id: camera_id.map(str::to_string),
                            captured_at: Some(Utc::now()),
                        };
                    }
                }
            }

            info!(
                total_detections = total,
                total_frames = frames.len(),
                elapsed_ms = overall.elapsed().as_millis() as u64,
                "Remote inference complete"
            );
        }
        .boxed()
    }
}
