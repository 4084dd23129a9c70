//! Job state machine: one queued job to a terminal upload status.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::TryStreamExt;
use reqwest::Client;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use super::events::{EventRecorder, JobRunContext};
use super::notifier::{NotifyError, WebhookNotifier};
use super::queue::QueuedJob;
use super::storage::{ObjectStore, StorageError};
use super::watchlist::WatchlistMatcher;
use crate::config::AppConfig;
use crate::db::Repository;
use crate::detector::{DetectorAdapter, DetectorError};
use crate::models::upload::Upload;

/// Settings the processor takes from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub videos_bucket: String,
    pub crops_bucket: String,
    pub presign_expiry: Duration,
    pub webhook_timeout: Duration,
    pub debug_frame_dir: Option<PathBuf>,
}

impl ProcessorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            videos_bucket: config.storage_bucket.clone(),
            crops_bucket: config.storage_crops_bucket.clone(),
            presign_expiry: config.presign_expiry(),
            webhook_timeout: config.webhook_timeout(),
            debug_frame_dir: config.debug_frame_dir(),
        }
    }
}

/// How a dequeued job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done { events: i32 },
    Failed { error: String },
    /// The upload no longer exists.
    Abandoned,
    /// The upload was already terminal, or another worker moved it first.
    Skipped,
}

/// A video readable from the local filesystem for the duration of a job.
enum LocalVideo {
    Stored(PathBuf),
    /// Removed when dropped.
    Downloaded(TempPath),
}

impl LocalVideo {
    fn path(&self) -> &Path {
        match self {
            LocalVideo::Stored(path) => path,
            LocalVideo::Downloaded(temp) => temp,
        }
    }
}

pub struct JobProcessor {
    repo: Arc<dyn Repository>,
    store: Arc<dyn ObjectStore>,
    detector: DetectorAdapter,
    recorder: EventRecorder,
    matcher: WatchlistMatcher,
    http: Client,
    videos_bucket: String,
    presign_expiry: Duration,
}

impl JobProcessor {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<dyn ObjectStore>,
        detector: DetectorAdapter,
        settings: ProcessorSettings,
    ) -> Result<Self, ProcessError> {
        let notifier = WebhookNotifier::new(settings.webhook_timeout)?;
        Ok(Self {
            recorder: EventRecorder::new(
                repo.clone(),
                store.clone(),
                settings.crops_bucket,
                settings.debug_frame_dir,
            ),
            matcher: WatchlistMatcher::new(repo.clone(), notifier),
            repo,
            store,
            detector,
            http: Client::new(),
            videos_bucket: settings.videos_bucket,
            presign_expiry: settings.presign_expiry,
        })
    }

    pub fn detector(&self) -> &DetectorAdapter {
        &self.detector
    }

    /// Drive one job to a terminal state.
    ///
    /// Detection and persistence failures mark the upload FAILED and are
    /// reported as [`JobOutcome::Failed`]. Only failures to read or write the
    /// upload row itself are returned as errors.
    pub async fn process(&self, job: &QueuedJob) -> Result<JobOutcome, ProcessError> {
        let Some(upload) = self.repo.get_upload(job.upload_id).await? else {
            error!(job_id = %job.job_id, upload_id = %job.upload_id, "Upload not found, abandoning job");
            return Ok(JobOutcome::Abandoned);
        };

        if upload.status.is_terminal() {
            warn!(
                job_id = %job.job_id,
                upload_id = %upload.id,
                status = %upload.status,
                "Upload already terminal, skipping redelivered job"
            );
            return Ok(JobOutcome::Skipped);
        }

        if !self.repo.mark_processing(upload.id, Utc::now()).await? {
            warn!(job_id = %job.job_id, upload_id = %upload.id, "Upload changed state concurrently, skipping");
            return Ok(JobOutcome::Skipped);
        }

        info!(job_id = %job.job_id, upload_id = %upload.id, backend = self.detector.backend_name(), "Processing upload");
        let start = Instant::now();

        let outcome = match self.run(job, &upload).await {
            Ok(events) => {
                if !self.repo.mark_done(upload.id, Utc::now(), events).await? {
                    warn!(job_id = %job.job_id, upload_id = %upload.id, "Upload left PROCESSING concurrently, result discarded");
                    return Ok(JobOutcome::Skipped);
                }
                metrics::counter!("anpr_jobs_processed").increment(1);
                info!(
                    job_id = %job.job_id,
                    upload_id = %upload.id,
                    events,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Upload processed"
                );
                JobOutcome::Done { events }
            }
            Err(e) => {
                let message = e.to_string();
                error!(job_id = %job.job_id, upload_id = %upload.id, error = %message, "Job processing failed");
                if !self.repo.mark_failed(upload.id, Utc::now(), &message).await? {
                    warn!(job_id = %job.job_id, upload_id = %upload.id, "Upload left PROCESSING concurrently, failure not recorded");
                    return Ok(JobOutcome::Skipped);
                }
                metrics::counter!("anpr_jobs_failed").increment(1);
                JobOutcome::Failed { error: message }
            }
        };

        metrics::histogram!("anpr_job_processing_seconds").record(start.elapsed().as_secs_f64());
        Ok(outcome)
    }

    async fn run(&self, job: &QueuedJob, upload: &Upload) -> Result<i32, ProcessError> {
        let video = self.resolve_video(&job.storage_path).await?;
        let camera_id = job.camera_id.as_deref().or(upload.camera_id.as_deref());

        let mut ctx = JobRunContext::new(job.job_id, upload.id);
        let mut detections = self.detector.process_video(video.path(), camera_id);
        let mut events = 0i32;

        while let Some(detection) = detections.try_next().await? {
            let event = self.recorder.record(&mut ctx, upload, detection).await?;
            events += 1;
            metrics::counter!("anpr_events_processed").increment(1);
            self.matcher.check_event(&event).await?;
        }

        Ok(events)
    }

    /// Local path for `storage_path`: used directly for `file://` URLs,
    /// otherwise downloaded to a temporary `.mp4`.
    async fn resolve_video(&self, storage_path: &str) -> Result<LocalVideo, ProcessError> {
        let url = self
            .store
            .presigned_url(&self.videos_bucket, storage_path, self.presign_expiry)
            .await?;

        if let Some(local) = url.strip_prefix("file://") {
            let path = PathBuf::from(local);
            if !path.exists() {
                return Err(ProcessError::VideoNotFound(path));
            }
            info!(path = %path.display(), "Using local file directly");
            return Ok(LocalVideo::Stored(path));
        }

        let temp = tempfile::Builder::new()
            .prefix("anpr_video_")
            .suffix(".mp4")
            .tempfile()?
            .into_temp_path();

        let mut response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(ProcessError::Download)?
            .error_for_status()
            .map_err(ProcessError::Download)?;

        let mut file = tokio::fs::File::create(&temp).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(ProcessError::Download)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!(path = %temp.display(), bytes = written, "Video downloaded");
        Ok(LocalVideo::Downloaded(temp))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Detection failed: {0}")]
    Detector(#[from] DetectorError),

    #[error("Video download failed: {0}")]
    Download(reqwest::Error),

    #[error("Local video not found: {0}")]
    VideoNotFound(PathBuf),

    #[error("Image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Notifier setup failed: {0}")]
    Notify(#[from] NotifyError),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
