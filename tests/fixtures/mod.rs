//! Test fixtures: uploads, watchlist entries, jobs and scripted detections

use anpr_pipeline::models::detection::{BBox, Crop, RawDetection};
use anpr_pipeline::models::upload::{Upload, UploadStatus};
use anpr_pipeline::models::watchlist::WatchlistEntry;
use anpr_pipeline::services::queue::QueuedJob;
use chrono::{DateTime, Duration, Utc};
use image::{Rgb, RgbImage};
use uuid::Uuid;

pub const CAMERA_ID: &str = "cam-north-gate";

/// Upload in PENDING pointing at `storage_path` in the videos bucket
pub fn pending_upload(storage_path: &str) -> Upload {
    Upload {
        id: Uuid::new_v4(),
        camera_id: Some(CAMERA_ID.to_string()),
        storage_path: storage_path.to_string(),
        status: UploadStatus::Pending,
        started_at: None,
        completed_at: None,
        events_detected: 0,
        error_message: None,
    }
}

pub fn upload_with_status(storage_path: &str, status: UploadStatus) -> Upload {
    Upload {
        status,
        ..pending_upload(storage_path)
    }
}

pub fn job_for(upload: &Upload) -> QueuedJob {
    QueuedJob {
        job_id: Uuid::new_v4(),
        upload_id: upload.id,
        storage_path: upload.storage_path.clone(),
        camera_id: None,
    }
}

pub fn watchlist_entry(pattern: &str, webhook: Option<String>) -> WatchlistEntry {
    WatchlistEntry {
        id: Uuid::new_v4(),
        plate_pattern: pattern.to_string(),
        active: true,
        expires_at: None,
        notification_webhook: webhook,
    }
}

pub fn expired_entry(pattern: &str, now: DateTime<Utc>) -> WatchlistEntry {
    WatchlistEntry {
        expires_at: Some(now - Duration::hours(2)),
        ..watchlist_entry(pattern, None)
    }
}

/// Backend output with no crop or frame attached
pub fn raw_detection(plate: &str, confidence: f32, frame_no: u64) -> RawDetection {
    RawDetection {
        plate_text: plate.to_string(),
        normalized_plate: None,
        confidence,
        bbox: BBox::new(100, 80, 220, 120),
        frame_no,
        crop: None,
        frame: None,
        camera_id: None,
        captured_at: None,
    }
}

/// Uniform gray crop, as produced when a decoder hands back a blank frame
pub fn solid_crop() -> Crop {
    Crop {
        image: RgbImage::from_pixel(120, 40, Rgb([128, 128, 128])),
        solid_color: true,
    }
}

pub fn gradient_frame(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
    })
}
