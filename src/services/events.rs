use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::processor::ProcessError;
use super::storage::ObjectStore;
use crate::db::Repository;
use crate::media::crop::pixel_range;
use crate::models::detection::{Crop, Detection};
use crate::models::event::{Event, NewEvent};
use crate::models::upload::Upload;

const JPEG_QUALITY: u8 = 90;

/// State scoped to one job run, passed explicitly into event persistence.
#[derive(Debug)]
pub struct JobRunContext {
    pub job_id: Uuid,
    pub upload_id: Uuid,
    debug_frame_saved: bool,
}

impl JobRunContext {
    pub fn new(job_id: Uuid, upload_id: Uuid) -> Self {
        Self {
            job_id,
            upload_id,
            debug_frame_saved: false,
        }
    }

    pub fn debug_frame_saved(&self) -> bool {
        self.debug_frame_saved
    }
}

/// Storage key for a crop belonging to `upload_id`.
pub fn crop_key(upload_id: Uuid) -> String {
    format!("crops/{}/{}.jpg", upload_id, Uuid::new_v4())
}

/// Persists detections as events, uploading their crops.
pub struct EventRecorder {
    repo: Arc<dyn Repository>,
    store: Arc<dyn ObjectStore>,
    crops_bucket: String,
    debug_frame_dir: Option<PathBuf>,
}

impl EventRecorder {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<dyn ObjectStore>,
        crops_bucket: impl Into<String>,
        debug_frame_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            repo,
            store,
            crops_bucket: crops_bucket.into(),
            debug_frame_dir,
        }
    }

    /// Upload the crop (if any) and insert the event row.
    pub async fn record(
        &self,
        ctx: &mut JobRunContext,
        upload: &Upload,
        detection: Detection,
    ) -> Result<Event, ProcessError> {
        let frame_no = detection.frame_no;

        match &detection.frame {
            Some(frame) => {
                let (min, max) = pixel_range(frame);
                debug!(
                    job_id = %ctx.job_id,
                    frame_no,
                    width = frame.width(),
                    height = frame.height(),
                    min,
                    max,
                    "Frame statistics"
                );
                self.save_debug_frame(ctx, frame, frame_no).await;
            }
            None => debug!(job_id = %ctx.job_id, frame_no, "Detection carries no frame"),
        }

        let crop_path = match &detection.crop {
            Some(crop) => Some(self.store_crop(ctx, crop, frame_no).await?),
            None => None,
        };

        let event = self
            .repo
            .insert_event(NewEvent {
                upload_id: upload.id,
                camera_id: detection.camera_id.or_else(|| upload.camera_id.clone()),
                plate: detection.plate,
                normalized_plate: detection.normalized_plate,
                confidence: detection.confidence,
                bbox: detection.bbox,
                frame_no: i64::try_from(frame_no).unwrap_or(i64::MAX),
                captured_at: detection.captured_at,
                crop_path,
            })
            .await?;

        info!(
            event_id = %event.id,
            upload_id = %upload.id,
            plate = %event.plate,
            confidence = event.confidence,
            "Event saved"
        );
        Ok(event)
    }

    async fn store_crop(
        &self,
        ctx: &JobRunContext,
        crop: &Crop,
        frame_no: u64,
    ) -> Result<String, ProcessError> {
        let (min, max) = pixel_range(&crop.image);
        debug!(
            job_id = %ctx.job_id,
            frame_no,
            width = crop.image.width(),
            height = crop.image.height(),
            min,
            max,
            "Crop statistics"
        );
        if crop.solid_color {
            warn!(
                job_id = %ctx.job_id,
                frame_no,
                value = min,
                "Crop is solid color, likely decode failure"
            );
        }

        let bytes = encode_jpeg(crop.image.clone()).await?;
        let key = crop_key(ctx.upload_id);
        self.store
            .upload_file(&self.crops_bucket, &key, &bytes, "image/jpeg")
            .await?;
        Ok(key)
    }

    /// At most one full frame per job; failures are logged and ignored.
    async fn save_debug_frame(&self, ctx: &mut JobRunContext, frame: &Arc<RgbImage>, frame_no: u64) {
        let Some(dir) = self.debug_frame_dir.as_deref() else {
            return;
        };
        if ctx.debug_frame_saved {
            return;
        }
        ctx.debug_frame_saved = true;

        let path = dir.join(format!("fullframe_{}_frame{}.jpg", ctx.upload_id, frame_no));
        match write_debug_frame(&path, Arc::clone(frame)).await {
            Ok(()) => info!(path = %path.display(), "Full frame saved"),
            Err(e) => error!(path = %path.display(), error = %e, "Full frame save failed"),
        }
    }
}

async fn encode_jpeg(image: RgbImage) -> Result<Vec<u8>, ProcessError> {
    tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        image.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))?;
        Ok::<_, ProcessError>(buf)
    })
    .await
    .map_err(|e| ProcessError::Task(e.to_string()))?
}

async fn write_debug_frame(path: &Path, frame: Arc<RgbImage>) -> Result<(), ProcessError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = encode_jpeg(frame.as_ref().clone()).await?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
