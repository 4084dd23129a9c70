#![cfg(feature = "local-model")]

//! On-host plate localization and text recognition with tract.
//!
//! The localizer is a single-class YOLO-style ONNX export
//! (`[1, 4 + classes, anchors]` or its transpose). The recognizer is a CTC
//! text model taking a 32x128 RGB crop and producing `[1, steps, classes]`
//! logits, class 0 being the blank.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::{stream, try_stream};
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tokio::sync::OnceCell;
use tract_onnx::prelude::*;
use tracing::{debug, error, info, warn};

use super::normalize::UNREAD;
use super::{BackendError, BackendKind, DetectionStream, DetectorConfig, DetectorError, PlateDetector};
use crate::media::crop::{pad_bbox, pixel_range, CROP_PADDING};
use crate::media::frames::load_frame;
use crate::media::{extract_crop, Ffmpeg};
use crate::models::detection::{BBox, RawDetection};

const OCR_INPUT_HEIGHT: u32 = 32;
const OCR_INPUT_WIDTH: u32 = 128;
const NMS_IOU: f32 = 0.45;

type Plan = TypedRunnableModel<TypedModel>;

/// Where decoded frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// In-process FFmpeg libraries (`native-decode` feature).
    Native,
    /// The ffmpeg command-line tool writing JPEGs to a temporary directory.
    FfmpegCli,
}

struct PlateModels {
    localizer: Plan,
    recognizer: Plan,
    input_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    bbox: BBox,
    confidence: f32,
}

pub struct LocalModelDetector {
    source: FrameSource,
    plate_model_path: PathBuf,
    ocr_model_path: PathBuf,
    charset: Vec<char>,
    input_size: u32,
    threshold: f32,
    min_box_width: i32,
    min_box_height: i32,
    fps: u32,
    ffmpeg: Ffmpeg,
    models: OnceCell<Arc<PlateModels>>,
}

impl LocalModelDetector {
    /// Check prerequisites. Models are loaded on first use, not here.
    pub fn new(config: &DetectorConfig, source: FrameSource) -> Result<Self, BackendError> {
        let kind = match source {
            FrameSource::Native => BackendKind::LocalModel,
            FrameSource::FfmpegCli => BackendKind::LocalModelFfmpeg,
        };

        for path in [&config.plate_model_path, &config.ocr_model_path] {
            if !path.is_file() {
                return Err(BackendError::unavailable(
                    kind,
                    format!("model file not found: {}", path.display()),
                ));
            }
        }

        let ffmpeg = Ffmpeg::new(config.ffmpeg_path.clone(), config.extraction_timeout);
        match source {
            FrameSource::Native if !cfg!(feature = "native-decode") => {
                return Err(BackendError::unavailable(
                    kind,
                    "built without the `native-decode` feature",
                ));
            }
            FrameSource::FfmpegCli => {
                ffmpeg
                    .ensure_available()
                    .map_err(|e| BackendError::unavailable(kind, e.to_string()))?;
            }
            FrameSource::Native => {}
        }

        if config.device != "cpu" {
            warn!(device = %config.device, "Only CPU inference is supported, ignoring device");
        }

        info!(
            backend = %kind,
            plate_model = %config.plate_model_path.display(),
            ocr_model = %config.ocr_model_path.display(),
            confidence = config.backend_threshold,
            fps = config.fps,
            min_box_size = %format!("{}x{}", config.min_box_width, config.min_box_height),
            "Local model detector initialized"
        );

        Ok(Self {
            source,
            plate_model_path: config.plate_model_path.clone(),
            ocr_model_path: config.ocr_model_path.clone(),
            charset: config.ocr_charset.chars().collect(),
            input_size: config.model_input_size,
            threshold: config.backend_threshold,
            min_box_width: config.min_box_width as i32,
            min_box_height: config.min_box_height as i32,
            fps: config.fps,
            ffmpeg,
            models: OnceCell::new(),
        })
    }

    async fn models(&self) -> Result<Arc<PlateModels>, DetectorError> {
        self.models
            .get_or_try_init(|| async {
                let plate_path = self.plate_model_path.clone();
                let ocr_path = self.ocr_model_path.clone();
                let size = self.input_size;
                info!(plate_model = %plate_path.display(), "Loading plate models");
                let models = tokio::task::spawn_blocking(move || {
                    Ok::<_, DetectorError>(PlateModels {
                        localizer: load_plan(&plate_path, size, size)?,
                        recognizer: load_plan(&ocr_path, OCR_INPUT_HEIGHT, OCR_INPUT_WIDTH)?,
                        input_size: size,
                    })
                })
                .await
                .map_err(|e| DetectorError::Inference(format!("model load task failed: {}", e)))??;
                info!("Plate models loaded");
                Ok::<_, DetectorError>(Arc::new(models))
            })
            .await
            .cloned()
    }

    /// Sampled frames in order. Extraction failures end the sequence early.
    fn frames<'a>(&'a self, video: &'a Path) -> BoxStream<'a, (u64, RgbImage)> {
        match self.source {
            FrameSource::FfmpegCli => stream! {
                let workdir = match tempfile::Builder::new().prefix("anpr_frames_").tempdir() {
                    Ok(dir) => dir,
                    Err(e) => {
                        error!(error = %e, "Could not create frame directory");
                        return;
                    }
                };
                let files = match self.ffmpeg.extract_frames(video, self.fps, workdir.path()).await {
                    Ok(files) => files,
                    Err(e) => {
                        error!(video = %video.display(), error = %e, "Frame extraction failed, no frames produced");
                        return;
                    }
                };
                for (index, path) in files.iter().enumerate() {
                    match load_frame(path).await {
                        Ok(frame) => yield (index as u64, frame.into_rgb8()),
                        Err(e) => warn!(frame = %path.display(), error = %e, "Failed to load frame, skipping"),
                    }
                }
            }
            .boxed(),
            #[cfg(feature = "native-decode")]
            FrameSource::Native => stream! {
                let mut rx = crate::media::native::spawn_sampled_decode(video, self.fps);
                while let Some(item) = rx.recv().await {
                    match item {
                        Ok(frame) => yield frame,
                        Err(e) => {
                            error!(video = %video.display(), error = %e, "Native decode failed, stopping");
                            return;
                        }
                    }
                }
            }
            .boxed(),
            #[cfg(not(feature = "native-decode"))]
            FrameSource::Native => futures::stream::empty().boxed(),
        }
    }
}

impl PlateDetector for LocalModelDetector {
    fn name(&self) -> &'static str {
        match self.source {
            FrameSource::Native => "local_model",
            FrameSource::FfmpegCli => "local_model_ffmpeg",
        }
    }

    fn detect<'a>(&'a self, video: &'a Path, camera_id: Option<&'a str>) -> DetectionStream<'a> {
        try_stream! {
            info!(video = %video.display(), camera_id = camera_id.unwrap_or("unknown"), backend = self.name(), "Starting video processing");

            if !video.exists() {
                Err::<(), _>(crate::media::MediaError::FileNotFound(video.to_path_buf()))?;
            }

            let models = self.models().await?;
            let mut frames = self.frames(video);
            let mut frames_processed = 0u64;
            let mut total = 0u64;
            let mut unread = 0u64;

            while let Some((frame_no, frame)) = frames.next().await {
                frames_processed += 1;
                let (min, max) = pixel_range(&frame);
                debug!(frame_no, width = frame.width(), height = frame.height(), min, max, "Frame statistics");

                let frame = Arc::new(frame);
                let candidates = {
                    let models = Arc::clone(&models);
                    let frame = Arc::clone(&frame);
                    let threshold = self.threshold;
                    tokio::task::spawn_blocking(move || models.localize(&frame, threshold)).await
                };
                let candidates = match candidates {
                    Ok(Ok(found)) => found,
                    Ok(Err(e)) => {
                        error!(frame_no, error = %e, "Localization failed, skipping frame");
                        continue;
                    }
                    Err(e) => {
                        error!(frame_no, error = %e, "Localization task failed, skipping frame");
                        continue;
                    }
                };

                let mut in_frame = 0usize;
                for candidate in candidates {
                    let bbox = candidate.bbox;
                    if bbox.width() < self.min_box_width || bbox.height() < self.min_box_height {
                        debug!(frame_no, width = bbox.width(), height = bbox.height(), "Box too small, skipping");
                        continue;
                    }

                    let crop = match extract_crop(&frame, &pad_bbox(&bbox, CROP_PADDING)) {
                        Ok(crop) => crop,
                        Err(rejection) => {
                            warn!(frame_no, reason = %rejection, "Crop rejected, skipping box");
                            continue;
                        }
                    };

                    let plate_text = {
                        let models = Arc::clone(&models);
                        let image = crop.image.clone();
                        let charset = self.charset.clone();
                        match tokio::task::spawn_blocking(move || models.read_text(&image, &charset)).await {
                            Ok(Ok(text)) => text,
                            Ok(Err(e)) => {
                                error!(frame_no, error = %e, "OCR failed");
                                UNREAD.to_string()
                            }
                            Err(e) => {
                                error!(frame_no, error = %e, "OCR task failed");
                                UNREAD.to_string()
                            }
                        }
                    };

                    total += 1;
                    in_frame += 1;
                    if plate_text == UNREAD {
                        unread += 1;
                    }

                    yield RawDetection {
                        normalized_plate: None,
                        plate_text,
                        confidence: candidate.confidence,
                        bbox,
                        frame_no,
                        crop: Some(crop),
                        frame: Some(Arc::clone(&frame)),
                        camera_id: camera_id.map(str::to_string),
                        captured_at: Some(Utc::now()),
                    };
                }

                if in_frame > 0 {
                    info!(frame_no, detections = in_frame, "Frame detections");
                }
            }

            let success_rate = if total > 0 {
                (total - unread) as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            info!(
                video = %video.display(),
                frames_processed,
                total_detections = total,
                ocr_failures = unread,
                ocr_success_rate = %format!("{:.1}%", success_rate),
                "Video processing complete"
            );
        }
        .boxed()
    }
}

fn load_plan(path: &Path, height: u32, width: u32) -> Result<Plan, DetectorError> {
    let fail = |stage: &str, e: &dyn std::fmt::Display| {
        DetectorError::Inference(format!("{} {}: {}", stage, path.display(), e))
    };
    tract_onnx::onnx()
        .model_for_path(path)
        .map_err(|e| fail("failed to load", &e))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(
                f32::datum_type(),
                tvec!(1, 3, height as usize, width as usize),
            ),
        )
        .map_err(|e| fail("failed to set input fact for", &e))?
        .into_optimized()
        .map_err(|e| fail("failed to optimize", &e))?
        .into_runnable()
        .map_err(|e| fail("failed to prepare", &e))
}

/// NCHW float tensor in [0, 1], resized to `width` x `height`.
fn to_input(image: &RgbImage, width: u32, height: u32) -> Tensor {
    let resized = imageops::resize(image, width, height, FilterType::Triangle);
    tract_ndarray::Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
    )
    .into_tensor()
}

impl PlateModels {
    fn localize(&self, frame: &RgbImage, threshold: f32) -> Result<Vec<Candidate>, DetectorError> {
        let size = self.input_size;
        let input = to_input(frame, size, size);
        let outputs = self
            .localizer
            .run(tvec!(input.into()))
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectorError::Inference("localizer produced no outputs".to_string()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| DetectorError::Inference(e.to_string()))?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|e| DetectorError::Inference(format!("unexpected localizer output: {}", e)))?;

        let scale_x = frame.width() as f32 / size as f32;
        let scale_y = frame.height() as f32 / size as f32;
        let candidates = decode_boxes(view, scale_x, scale_y, threshold);
        Ok(non_max_suppression(candidates, NMS_IOU))
    }

    fn read_text(&self, crop: &RgbImage, charset: &[char]) -> Result<String, DetectorError> {
        let input = to_input(crop, OCR_INPUT_WIDTH, OCR_INPUT_HEIGHT);
        let outputs = self
            .recognizer
            .run(tvec!(input.into()))
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectorError::Inference("recognizer produced no outputs".to_string()))?;
        let logits = output
            .to_array_view::<f32>()
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let classes = logits.shape().last().copied().unwrap_or(0);
        if classes == 0 {
            return Ok(UNREAD.to_string());
        }
        let values: Vec<f32> = logits.iter().copied().collect();
        let best: Vec<usize> = values.chunks(classes).map(argmax).collect();

        let text = ctc_greedy_decode(&best, charset);
        Ok(if text.is_empty() { UNREAD.to_string() } else { text })
    }
}

/// Candidates above `threshold`, mapped back to frame coordinates.
fn decode_boxes(
    output: tract_ndarray::ArrayView3<f32>,
    scale_x: f32,
    scale_y: f32,
    threshold: f32,
) -> Vec<Candidate> {
    let shape = output.shape();
    // Anchors usually outnumber attributes; use that to detect the layout
    let anchors_first = shape[1] > shape[2];
    let (anchors, attrs) = if anchors_first {
        (shape[1], shape[2])
    } else {
        (shape[2], shape[1])
    };
    if attrs < 5 {
        return Vec::new();
    }
    let at = |anchor: usize, attr: usize| {
        if anchors_first {
            output[[0, anchor, attr]]
        } else {
            output[[0, attr, anchor]]
        }
    };

    let mut found = Vec::new();
    for anchor in 0..anchors {
        let confidence = (4..attrs).map(|a| at(anchor, a)).fold(f32::NEG_INFINITY, f32::max);
        if !confidence.is_finite() || confidence < threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(anchor, 0), at(anchor, 1), at(anchor, 2), at(anchor, 3));
        found.push(Candidate {
            bbox: BBox::new(
                ((cx - w / 2.0) * scale_x).round() as i32,
                ((cy - h / 2.0) * scale_y).round() as i32,
                ((cx + w / 2.0) * scale_x).round() as i32,
                ((cy + h / 2.0) * scale_y).round() as i32,
            ),
            confidence,
        });
    }
    found
}

fn iou(a: &BBox, b: &BBox) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0) as f32;
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0) as f32;
    let inter = ix * iy;
    let area = |r: &BBox| (r.width().max(0) * r.height().max(0)) as f32;
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

fn non_max_suppression(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(&k.bbox, &candidate.bbox) < threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// Collapse repeats, drop blanks (class 0), map class `i` to `charset[i - 1]`.
fn ctc_greedy_decode(classes: &[usize], charset: &[char]) -> String {
    let mut text = String::new();
    let mut previous = 0usize;
    for &class in classes {
        if class != 0 && class != previous {
            if let Some(c) = charset.get(class - 1) {
                text.push(*c);
            }
        }
        previous = class;
    }
    text.trim().to_string()
}
