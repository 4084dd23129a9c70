//! Plate detector backends.
//!
//! A backend turns a local video file into a lazy, finite stream of
//! [`RawDetection`]s. Four variants exist, selected by configuration:
//!
//! | name                 | localization          | frames from            |
//! |----------------------|-----------------------|------------------------|
//! | `mock`               | seeded random plates  | ffmpeg if present      |
//! | `local_model`        | ONNX (tract)          | FFmpeg libraries       |
//! | `local_model_ffmpeg` | ONNX (tract)          | ffmpeg CLI             |
//! | `remote`             | HTTP inference service| ffmpeg CLI             |
//!
//! Construction is fallible per variant ([`build_backend`]); [`select_backend`]
//! applies the configured [`FallbackPolicy`] on top.

mod adapter;
#[cfg(feature = "local-model")]
mod local;
mod mock;
pub mod normalize;
mod remote;

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::BoxStream;
use serde::Deserialize;
use strum::{AsRefStr, Display, EnumString};
use tracing::{info, warn};

use crate::media::MediaError;
use crate::models::detection::RawDetection;

pub use adapter::DetectorAdapter;
#[cfg(feature = "local-model")]
pub use local::{FrameSource, LocalModelDetector};
pub use mock::MockDetector;
pub use normalize::canonicalize;
pub use remote::RemoteDetector;

/// Lazy, finite, non-restartable detection sequence.
pub type DetectionStream<'a> = BoxStream<'a, Result<RawDetection, DetectorError>>;

/// A swappable plate detection strategy.
pub trait PlateDetector: Send + Sync {
    /// Backend identifier, as used in configuration.
    fn name(&self) -> &'static str;

    /// Detect plates in a local video file.
    ///
    /// Consumers may stop polling at any point; implementations clean up
    /// their temporary files on drop.
    fn detect<'a>(&'a self, video: &'a Path, camera_id: Option<&'a str>) -> DetectionStream<'a>;
}

/// Configured detector variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    Mock,
    #[strum(to_string = "local_model", serialize = "yolo")]
    LocalModel,
    #[strum(to_string = "local_model_ffmpeg", serialize = "yolo_ffmpeg")]
    LocalModelFfmpeg,
    Remote,
}

/// What to run when the preferred backend cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FallbackPolicy {
    Mock,
    None,
}

/// Settings for every detector variant.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub backend: String,
    /// Global threshold applied by [`DetectorAdapter`].
    pub confidence_threshold: f32,
    /// Localization threshold inside the local-model variants.
    pub backend_threshold: f32,
    pub fps: u32,
    pub plate_model_path: PathBuf,
    pub ocr_model_path: PathBuf,
    pub ocr_charset: String,
    pub model_input_size: u32,
    pub device: String,
    pub min_box_width: u32,
    pub min_box_height: u32,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub remote_batch_size: usize,
    pub remote_timeout: Duration,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub extraction_timeout: Duration,
    pub mock_seed: Option<u64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            backend: "mock".to_string(),
            confidence_threshold: 0.7,
            backend_threshold: 0.30,
            fps: 1,
            plate_model_path: PathBuf::from("models/plate_detector.onnx"),
            ocr_model_path: PathBuf::from("models/plate_ocr.onnx"),
            ocr_charset: "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string(),
            model_input_size: 640,
            device: "cpu".to_string(),
            min_box_width: 20,
            min_box_height: 10,
            remote_url: None,
            remote_token: None,
            remote_batch_size: 8,
            remote_timeout: Duration::from_secs(30),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            extraction_timeout: Duration::from_secs(120),
            mock_seed: None,
        }
    }
}

/// The preferred backend could not be constructed.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Unknown detector backend '{0}'")]
    Unknown(String),

    #[error("Detector backend '{backend}' unavailable: {reason}")]
    Unavailable { backend: BackendKind, reason: String },
}

impl BackendError {
    pub fn unavailable(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            backend,
            reason: reason.into(),
        }
    }
}

/// Failure while a backend is producing detections.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Remote inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote inference returned {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    #[error("Remote inference response invalid: {0}")]
    InvalidResponse(String),

    #[error("Model inference failed: {0}")]
    Inference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Construct one variant. No fallback happens here.
pub async fn build_backend(
    kind: BackendKind,
    config: &DetectorConfig,
) -> Result<Box<dyn PlateDetector>, BackendError> {
    match kind {
        BackendKind::Mock => Ok(Box::new(MockDetector::new(config))),
        BackendKind::Remote => Ok(Box::new(RemoteDetector::connect(config).await?)),
        #[cfg(feature = "local-model")]
        BackendKind::LocalModel => Ok(Box::new(LocalModelDetector::new(
            config,
            FrameSource::Native,
        )?)),
        #[cfg(feature = "local-model")]
        BackendKind::LocalModelFfmpeg => Ok(Box::new(LocalModelDetector::new(
            config,
            FrameSource::FfmpegCli,
        )?)),
        #[cfg(not(feature = "local-model"))]
        BackendKind::LocalModel | BackendKind::LocalModelFfmpeg => Err(BackendError::unavailable(
            kind,
            "built without the `local-model` feature",
        )),
    }
}

/// Construct the configured backend, applying `policy` when that fails.
pub async fn select_backend(
    config: &DetectorConfig,
    policy: FallbackPolicy,
) -> Result<Box<dyn PlateDetector>, BackendError> {
    let preferred = config
        .backend
        .parse::<BackendKind>()
        .map_err(|_| BackendError::Unknown(config.backend.clone()));

    let result = match preferred {
        Ok(kind) => build_backend(kind, config).await,
        Err(e) => Err(e),
    };

    match (result, policy) {
        (Ok(backend), _) => {
            info!(backend = backend.name(), "Detector backend ready");
            Ok(backend)
        }
        (Err(e), FallbackPolicy::Mock) => {
            warn!(
                configured = %config.backend,
                error = %e,
                "Detector backend unavailable, falling back to mock"
            );
            metrics::counter!("anpr_detector_fallbacks").increment(1);
            build_backend(BackendKind::Mock, config).await
        }
        (Err(e), FallbackPolicy::None) => Err(e),
    }
}
