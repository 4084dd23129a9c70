use std::path::PathBuf;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::detector::{DetectorConfig, FallbackPolicy};

/// Where videos are read from and crops written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    R2,
    Local,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Ops listener bind address (serves /health and /metrics).
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Redis connection string for the job queue
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// Queue topic the worker consumes
    #[serde(default = "default_queue_topic")]
    #[garde(length(min = 1))]
    pub queue_topic: String,

    /// Bounded wait for a single dequeue call, in seconds
    #[serde(default = "default_dequeue_timeout_s")]
    #[garde(range(min = 1, max = 300))]
    pub dequeue_timeout_s: u64,

    /// Storage backend: "r2" or "local"
    #[serde(default = "default_storage_backend")]
    #[garde(skip)]
    pub storage_backend: StorageBackend,

    /// Bucket holding uploaded videos
    #[serde(default = "default_storage_bucket")]
    #[garde(length(min = 1))]
    pub storage_bucket: String,

    /// Bucket receiving plate crops
    #[serde(default = "default_crops_bucket")]
    #[garde(length(min = 1))]
    pub storage_crops_bucket: String,

    /// Root directory for the local storage backend
    #[serde(default = "default_local_storage_root")]
    #[garde(skip)]
    pub local_storage_root: PathBuf,

    /// R2 endpoint URL (S3-compatible)
    #[garde(skip)]
    pub r2_endpoint: Option<String>,

    /// R2 access key ID
    #[garde(skip)]
    pub r2_access_key: Option<String>,

    /// R2 secret access key
    #[garde(skip)]
    pub r2_secret_key: Option<String>,

    /// Lifetime of presigned video URLs, in seconds
    #[serde(default = "default_presign_expiry_s")]
    #[garde(range(min = 1, max = 604_800))]
    pub presign_expiry_s: u32,

    /// Detector variant: mock, local_model, local_model_ffmpeg or remote
    #[serde(default = "default_detector_backend")]
    #[garde(length(min = 1))]
    pub detector_backend: String,

    /// What to do when the configured detector cannot be built: "mock" or "none"
    #[serde(default = "default_detector_fallback")]
    #[garde(skip)]
    pub detector_fallback: FallbackPolicy,

    /// Global confidence threshold applied to every backend's output
    #[serde(default = "default_detection_confidence_threshold")]
    #[garde(custom(finite_unit_interval))]
    pub detection_confidence_threshold: f32,

    /// Backend-level localization threshold (local model variants)
    #[serde(default = "default_detect_confidence")]
    #[garde(custom(finite_unit_interval))]
    pub detect_confidence: f32,

    /// Frames sampled per second of video
    #[serde(default = "default_frame_extraction_fps")]
    #[garde(range(min = 1, max = 60))]
    pub frame_extraction_fps: u32,

    /// ONNX plate localization model
    #[serde(default = "default_plate_model_path")]
    #[garde(skip)]
    pub plate_model_path: PathBuf,

    /// ONNX CTC text recognition model
    #[serde(default = "default_ocr_model_path")]
    #[garde(skip)]
    pub ocr_model_path: PathBuf,

    /// Symbols emitted by the recognizer, in class order (blank excluded)
    #[serde(default = "default_ocr_charset")]
    #[garde(length(min = 1))]
    pub ocr_charset: String,

    /// Square input edge expected by the plate localizer
    #[serde(default = "default_model_input_size")]
    #[garde(range(min = 32, max = 4096))]
    pub model_input_size: u32,

    /// Inference device label (tract runs on CPU)
    #[serde(default = "default_device")]
    #[garde(skip)]
    pub device: String,

    #[serde(default = "default_min_box_width")]
    #[garde(skip)]
    pub min_box_width: u32,

    #[serde(default = "default_min_box_height")]
    #[garde(skip)]
    pub min_box_height: u32,

    /// Base URL of the remote inference service
    #[garde(skip)]
    pub remote_inference_url: Option<String>,

    /// Bearer token for the remote inference service
    #[garde(skip)]
    pub remote_inference_token: Option<String>,

    #[serde(default = "default_remote_frame_batch_size")]
    #[garde(range(min = 1, max = 256))]
    pub remote_frame_batch_size: usize,

    /// Read timeout for one remote batch request, in seconds
    #[serde(default = "default_remote_frame_timeout_s")]
    #[garde(range(min = 1, max = 600))]
    pub remote_frame_timeout_s: u64,

    #[serde(default = "default_ffmpeg_path")]
    #[garde(length(min = 1))]
    pub ffmpeg_path: String,

    #[serde(default = "default_ffprobe_path")]
    #[garde(length(min = 1))]
    pub ffprobe_path: String,

    /// Timeout for frame-extraction subprocesses, in seconds
    #[serde(default = "default_frame_extraction_timeout_s")]
    #[garde(range(min = 1, max = 3600))]
    pub frame_extraction_timeout_s: u64,

    /// Timeout for watchlist webhook delivery, in seconds
    #[serde(default = "default_webhook_timeout_s")]
    #[garde(range(min = 1, max = 120))]
    pub webhook_timeout_s: u64,

    /// Where one full frame per upload is written; empty disables it
    #[serde(default = "default_debug_frame_dir")]
    #[garde(skip)]
    pub debug_frame_dir: String,

    /// Seed for the mock detector
    #[garde(skip)]
    pub mock_seed: Option<u64>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_queue_topic() -> String {
    "video_processing".to_string()
}

fn default_dequeue_timeout_s() -> u64 {
    5
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}

fn default_storage_bucket() -> String {
    "anpr-videos".to_string()
}

fn default_crops_bucket() -> String {
    "anpr-crops".to_string()
}

fn default_local_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

fn default_presign_expiry_s() -> u32 {
    3600
}

fn default_detector_backend() -> String {
    "mock".to_string()
}

fn default_detector_fallback() -> FallbackPolicy {
    FallbackPolicy::Mock
}

/// Thresholds compare against detector confidences, so NaN would disable filtering.
fn finite_unit_interval(value: &f32, _ctx: &()) -> garde::Result {
    if value.is_finite() && (0.0..=1.0).contains(value) {
        Ok(())
    } else {
        Err(garde::Error::new(format!("{} is not a number in [0, 1]", value)))
    }
}

fn default_detection_confidence_threshold() -> f32 {
    0.7
}

fn default_detect_confidence() -> f32 {
    0.30
}

fn default_frame_extraction_fps() -> u32 {
    1
}

fn default_plate_model_path() -> PathBuf {
    PathBuf::from("models/plate_detector.onnx")
}

fn default_ocr_model_path() -> PathBuf {
    PathBuf::from("models/plate_ocr.onnx")
}

fn default_ocr_charset() -> String {
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string()
}

fn default_model_input_size() -> u32 {
    640
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_min_box_width() -> u32 {
    20
}

fn default_min_box_height() -> u32 {
    10
}

fn default_remote_frame_batch_size() -> usize {
    8
}

fn default_remote_frame_timeout_s() -> u64 {
    30
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_frame_extraction_timeout_s() -> u64 {
    120
}

fn default_webhook_timeout_s() -> u64 {
    10
}

fn default_debug_frame_dir() -> String {
    "storage/anpr-crops/debug".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Settings consumed by the detector subsystem.
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            backend: self.detector_backend.clone(),
            confidence_threshold: self.detection_confidence_threshold,
            backend_threshold: self.detect_confidence,
            fps: self.frame_extraction_fps,
            plate_model_path: self.plate_model_path.clone(),
            ocr_model_path: self.ocr_model_path.clone(),
            ocr_charset: self.ocr_charset.clone(),
            model_input_size: self.model_input_size,
            device: self.device.clone(),
            min_box_width: self.min_box_width,
            min_box_height: self.min_box_height,
            remote_url: self.remote_inference_url.clone(),
            remote_token: self.remote_inference_token.clone(),
            remote_batch_size: self.remote_frame_batch_size,
            remote_timeout: Duration::from_secs(self.remote_frame_timeout_s),
            ffmpeg_path: self.ffmpeg_path.clone(),
            ffprobe_path: self.ffprobe_path.clone(),
            extraction_timeout: Duration::from_secs(self.frame_extraction_timeout_s),
            mock_seed: self.mock_seed,
        }
    }

    pub fn debug_frame_dir(&self) -> Option<PathBuf> {
        if self.debug_frame_dir.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.debug_frame_dir))
        }
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.detector_fallback
    }

    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(u64::from(self.presign_expiry_s))
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_s)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
