use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use chrono::Utc;
use futures::StreamExt;
use image::{DynamicImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

use super::{canonicalize, DetectionStream, DetectorConfig, PlateDetector};
use crate::media::{crop_from_frame, probe_video, Ffmpeg, MediaError, VideoInfo};
use crate::models::detection::{BBox, RawDetection};

const MOCK_PLATES: [&str; 5] = ["ABC123", "XYZ789", "LMN456", "TEST99", "DEMO01"];

/// Geometry used when no codec is available to inspect the video.
const PLACEHOLDER_INFO: VideoInfo = VideoInfo {
    width: 1280,
    height: 720,
    fps: 25.0,
    total_frames: 250,
};

/// Deterministic-random plate generator for exercising the pipeline without ML.
///
/// Decodes the chosen frames through ffmpeg when it is installed; otherwise
/// crops come from synthesized placeholder frames.
pub struct MockDetector {
    ffmpeg: Ffmpeg,
    ffprobe: String,
    probe_timeout: Duration,
    seed: Option<u64>,
}

impl MockDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        info!(seed = ?config.mock_seed, "Mock detector initialized");
        Self {
            ffmpeg: Ffmpeg::new(config.ffmpeg_path.clone(), config.extraction_timeout),
            ffprobe: config.ffprobe_path.clone(),
            probe_timeout: config.extraction_timeout,
            seed: config.mock_seed,
        }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Video geometry, or `None` when frames must be synthesized.
    async fn inspect(&self, video: &Path) -> Option<VideoInfo> {
        if !self.ffmpeg.is_available() {
            info!(ffmpeg = self.ffmpeg.binary(), "Codec unavailable, synthesizing placeholder frames");
            return None;
        }

        match probe_video(&self.ffprobe, video, self.probe_timeout).await {
            Ok(info) if info.total_frames > 0 => Some(info),
            Ok(_) => {
                warn!(video = %video.display(), "Probe reported no frames, synthesizing");
                None
            }
            Err(e) => {
                warn!(video = %video.display(), error = %e, "Probe failed, synthesizing");
                None
            }
        }
    }

    async fn frame_at(&self, video: &Path, info: Option<&VideoInfo>, frame_no: u64) -> DynamicImage {
        let geometry = info.unwrap_or(&PLACEHOLDER_INFO);
        if info.is_some() {
            let seconds = frame_no as f64 / geometry.fps;
            match self.ffmpeg.extract_frame_at(video, seconds).await {
                Ok(frame) => return frame,
                Err(e) => {
                    warn!(frame_no, error = %e, "Frame decode failed, using placeholder");
                }
            }
        }
        DynamicImage::ImageRgb8(placeholder_frame(geometry.width, geometry.height))
    }
}

impl PlateDetector for MockDetector {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn detect<'a>(&'a self, video: &'a Path, camera_id: Option<&'a str>) -> DetectionStream<'a> {
        try_stream! {
            info!(video = %video.display(), camera_id = camera_id.unwrap_or("unknown"), "Processing video (mock mode)");

            if !video.exists() {
                error!(video = %video.display(), "Video file not found");
                Err::<(), _>(MediaError::FileNotFound(video.to_path_buf()))?;
            }

            let info = self.inspect(video).await;
            let total_frames = info.as_ref().unwrap_or(&PLACEHOLDER_INFO).total_frames;

            let mut rng = self.rng();
            let frames = pick_frames(&mut rng, total_frames);
            let mut yielded = 0usize;

            for frame_no in frames {
                let frame = self.frame_at(video, info.as_ref(), frame_no).await;
                let plate = MOCK_PLATES.choose(&mut rng).copied().unwrap_or("ABC123");
                let confidence: f32 = rng.gen_range(0.75..=0.95);
                let bbox = random_bbox(&mut rng, frame.width(), frame.height());

                let crop = match crop_from_frame(&frame, &bbox) {
                    Ok(crop) => crop,
                    Err(rejection) => {
                        warn!(frame_no, reason = %rejection, "Crop rejected, dropping detection");
                        continue;
                    }
                };

                yielded += 1;
                yield RawDetection {
                    plate_text: plate.to_string(),
                    normalized_plate: Some(canonicalize(plate)),
                    confidence,
                    bbox,
                    frame_no,
                    crop: Some(crop),
                    frame: Some(Arc::new(frame.into_rgb8())),
                    camera_id: camera_id.map(str::to_string),
                    captured_at: Some(Utc::now()),
                };
            }

            info!(total_frames, mock_detections = yielded, "Video processing complete (mock mode)");
        }
        .boxed()
    }
}

/// Distinct, sorted frame numbers carrying a detection: 2 to 5 per video.
fn pick_frames(rng: &mut StdRng, total_frames: u64) -> Vec<u64> {
    let upper = (total_frames / 100).clamp(2, 5) as usize;
    let wanted = rng.gen_range(2..=upper);
    let span = total_frames.saturating_sub(1).max(1) as usize;

    let mut frames: Vec<u64> = rand::seq::index::sample(rng, span, wanted.min(span))
        .into_iter()
        .map(|i| i as u64)
        .collect();
    frames.sort_unstable();
    frames
}

fn random_bbox(rng: &mut StdRng, width: u32, height: u32) -> BBox {
    let w = width as i32;
    let h = height as i32;
    let x1 = rng.gen_range(w / 4..=w / 2);
    let y1 = rng.gen_range(h / 4..=h / 2);
    let x2 = (x1 + rng.gen_range(80..=120)).min(w - 1);
    let y2 = (y1 + rng.gen_range(30..=50)).min(h - 1);
    BBox::new(x1, y1, x2, y2)
}

/// Non-uniform stand-in frame so synthesized crops are never solid.
fn placeholder_frame(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn offline_config(seed: u64) -> DetectorConfig {
        DetectorConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
            mock_seed: Some(seed),
            ..Default::default()
        }
    }

    #[test]
    fn test_pick_frames_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        for total in [0u64, 1, 2, 250, 10_000] {
            let frames = pick_frames(&mut rng, total);
            assert!(!frames.is_empty() && frames.len() <= 5);
            assert!(frames.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_random_bbox_inside_frame() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let bbox = random_bbox(&mut rng, 640, 360);
            assert!(bbox.x1 >= 160 && bbox.x2 <= 639);
            assert!(bbox.y1 >= 90 && bbox.y2 <= 359);
            assert!(bbox.width() > 0 && bbox.height() > 0);
        }
    }

    #[tokio::test]
    async fn test_synthesized_detections_are_valid() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"not really a video").unwrap();

        let detector = MockDetector::new(&offline_config(42));
        let detections: Vec<RawDetection> =
            detector.detect(&video, Some("cam-1")).try_collect().await.unwrap();

        assert!(detections.len() >= 2);
        for d in &detections {
            assert!(MOCK_PLATES.contains(&d.plate_text.as_str()));
            assert!((0.75..=0.95).contains(&d.confidence));
            let crop = d.crop.as_ref().unwrap();
            assert!(crop.image.width() >= 5 && crop.image.height() >= 5);
            assert!(!crop.solid_color);
            assert_eq!(d.camera_id.as_deref(), Some("cam-1"));
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_plates() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"x").unwrap();

        let detector = MockDetector::new(&offline_config(7));
        let first: Vec<(String, u64)> = detector
            .detect(&video, None)
            .map_ok(|d| (d.plate_text, d.frame_no))
            .try_collect()
            .await
            .unwrap();
        let second: Vec<(String, u64)> = detector
            .detect(&video, None)
            .map_ok(|d| (d.plate_text, d.frame_no))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_video_is_error() {
        let detector = MockDetector::new(&offline_config(1));
        let result: Result<Vec<RawDetection>, _> = detector
            .detect(Path::new("/nonexistent/clip.mp4"), None)
            .try_collect()
            .await;
        assert!(result.is_err());
    }
}
