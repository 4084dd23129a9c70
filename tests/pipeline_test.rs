//! Job pipeline tests against in-memory persistence and a local object store.
//!
//! Run with: cargo test --test pipeline_test

mod fixtures;
mod helpers;

use anpr_pipeline::detector::{self, DetectorConfig, FallbackPolicy};
use anpr_pipeline::media::{crop_from_frame, CropRejection};
use anpr_pipeline::models::detection::BBox;
use anpr_pipeline::models::upload::UploadStatus;
use anpr_pipeline::services::processor::JobOutcome;
use axum::http::StatusCode;
use chrono::Utc;
use fixtures::*;
use helpers::*;
use futures::StreamExt;
use image::DynamicImage;
use regex::Regex;

#[tokio::test]
async fn test_mock_backend_events_respect_threshold() {
    let harness = Harness::new();
    let upload = pending_upload("videos/gate-0800.mp4");
    harness.seed_upload(&upload).await;

    let config = offline_detector_config(11);
    let processor = harness.mock_processor(&config).await;

    let outcome = tokio_test::assert_ok!(processor.process(&job_for(&upload)).await);

    let events = harness.repo.events_for(upload.id);
    assert!(!events.is_empty());
    assert_eq!(outcome, JobOutcome::Done { events: events.len() as i32 });

    let canonical = Regex::new("^[A-Z0-9]*$").unwrap();
    for event in &events {
        assert!(event.confidence >= config.confidence_threshold);
        assert!(canonical.is_match(&event.normalized_plate));
        assert_eq!(event.camera_id.as_deref(), Some(CAMERA_ID));

        let key = event.crop_path.as_deref().expect("mock events carry crops");
        assert!(key.starts_with(&format!("crops/{}/", upload.id)));
        assert!(harness.crop_file(key).exists());
    }

    let stored = harness.repo.upload(upload.id).unwrap();
    assert_eq!(stored.status, UploadStatus::Done);
    assert_eq!(stored.events_detected, events.len() as i32);
    assert!(stored.started_at.is_some() && stored.completed_at.is_some());
}

#[tokio::test]
async fn test_debug_frame_written_once_per_upload() {
    let harness = Harness::new();
    let upload = pending_upload("videos/debug.mp4");
    harness.seed_upload(&upload).await;

    let processor = harness.mock_processor(&offline_detector_config(5)).await;
    processor.process(&job_for(&upload)).await.unwrap();

    assert!(harness.repo.events_for(upload.id).len() >= 2);
    let written: Vec<_> = std::fs::read_dir(harness.debug_dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(written.len(), 1);
    assert!(written[0].starts_with(&format!("fullframe_{}_frame", upload.id)));
}

#[tokio::test]
async fn test_threshold_drops_low_confidence_detections() {
    let harness = Harness::new();
    let upload = pending_upload("videos/mixed.mp4");
    harness.seed_upload(&upload).await;

    let processor = harness.scripted_processor(
        vec![
            raw_detection("ab-123", 0.91, 0),
            raw_detection("low 1", 0.69, 1),
            raw_detection("xyz 789", 0.70, 2),
        ],
        0.7,
    );
    let outcome = processor.process(&job_for(&upload)).await.unwrap();
    assert_eq!(outcome, JobOutcome::Done { events: 2 });

    let plates: Vec<String> = harness
        .repo
        .events_for(upload.id)
        .into_iter()
        .map(|e| e.normalized_plate)
        .collect();
    assert_eq!(plates, vec!["AB123", "XYZ789"]);
}

#[tokio::test]
async fn test_remote_health_failure_falls_back_to_mock() {
    let harness = Harness::new();
    let upload = pending_upload("videos/remote.mp4");
    harness.seed_upload(&upload).await;

    let remote_url = spawn_remote_detector(StatusCode::SERVICE_UNAVAILABLE).await;
    let config = DetectorConfig {
        backend: "remote".to_string(),
        remote_url: Some(remote_url),
        ..offline_detector_config(3)
    };

    let backend = detector::select_backend(&config, FallbackPolicy::Mock)
        .await
        .unwrap();
    assert_eq!(backend.name(), "mock");

    let processor = harness.mock_processor(&config).await;
    let outcome = processor.process(&job_for(&upload)).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Done { .. }));
    assert_eq!(
        harness.repo.upload(upload.id).unwrap().status,
        UploadStatus::Done
    );
}

#[tokio::test]
async fn test_remote_health_failure_without_fallback_errors() {
    let remote_url = spawn_remote_detector(StatusCode::SERVICE_UNAVAILABLE).await;
    let config = DetectorConfig {
        backend: "remote".to_string(),
        remote_url: Some(remote_url),
        ..offline_detector_config(3)
    };
    assert!(detector::select_backend(&config, FallbackPolicy::None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_solid_color_crop_still_creates_event() {
    let harness = Harness::new();
    let upload = pending_upload("videos/blank.mp4");
    harness.seed_upload(&upload).await;

    let mut detection = raw_detection("TEST99", 0.88, 4);
    detection.crop = Some(solid_crop());
    let processor = harness.scripted_processor(vec![detection], 0.7);

    let outcome = processor.process(&job_for(&upload)).await.unwrap();
    assert_eq!(outcome, JobOutcome::Done { events: 1 });

    let events = harness.repo.events_for(upload.id);
    let key = events[0].crop_path.as_deref().unwrap();
    let bytes = std::fs::read(harness.crop_file(key)).unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
}

#[test]
fn test_undersized_crop_is_rejected() {
    let frame = DynamicImage::ImageRgb8(gradient_frame(64, 48));

    // Clamped to 4px wide at the right edge
    let result = crop_from_frame(&frame, &BBox::new(60, 10, 90, 30));
    assert_eq!(result.unwrap_err(), CropRejection::TooSmall { width: 4, height: 20 });

    let crop = crop_from_frame(&frame, &BBox::new(10, 10, 15, 15)).unwrap();
    assert_eq!(crop.image.dimensions(), (5, 5));
}

#[tokio::test]
async fn test_missing_local_video_fails_job() {
    let harness = Harness::new();
    let upload = pending_upload("videos/never-uploaded.mp4");
    harness.repo.insert_upload(upload.clone());

    let processor = harness.mock_processor(&offline_detector_config(1)).await;
    let outcome = processor.process(&job_for(&upload)).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Failed { .. }));

    let stored = harness.repo.upload(upload.id).unwrap();
    assert_eq!(stored.status, UploadStatus::Failed);
    assert!(stored
        .error_message
        .as_deref()
        .unwrap()
        .contains("never-uploaded.mp4"));
    assert!(harness.repo.events_for(upload.id).is_empty());
}

#[tokio::test]
async fn test_terminal_upload_is_not_reprocessed() {
    let harness = Harness::new();
    for status in [UploadStatus::Done, UploadStatus::Failed] {
        let upload = upload_with_status("videos/old.mp4", status);
        harness.seed_upload(&upload).await;

        let processor = harness.scripted_processor(vec![raw_detection("ABC123", 0.9, 0)], 0.7);
        let outcome = processor.process(&job_for(&upload)).await.unwrap();

        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(harness.repo.upload(upload.id).unwrap().status, status);
        assert!(harness.repo.events_for(upload.id).is_empty());
    }
}

#[tokio::test]
async fn test_redelivered_processing_upload_is_resumed() {
    let harness = Harness::new();
    let upload = upload_with_status("videos/retry.mp4", UploadStatus::Processing);
    harness.seed_upload(&upload).await;

    let processor = harness.scripted_processor(vec![raw_detection("DEMO01", 0.8, 0)], 0.7);
    let outcome = processor.process(&job_for(&upload)).await.unwrap();
    assert_eq!(outcome, JobOutcome::Done { events: 1 });
    assert!(harness.repo.events_for(upload.id)[0].captured_at <= Utc::now());
}

/// Finishes the upload behind the processor's back, as a second worker would
struct RacingDetector {
    repo: std::sync::Arc<anpr_pipeline::db::MemoryRepository>,
    upload: anpr_pipeline::models::upload::Upload,
}

impl anpr_pipeline::detector::PlateDetector for RacingDetector {
    fn name(&self) -> &'static str {
        "racing"
    }

    fn detect<'a>(
        &'a self,
        _video: &'a std::path::Path,
        _camera_id: Option<&'a str>,
    ) -> anpr_pipeline::detector::DetectionStream<'a> {
        let mut finished = self.upload.clone();
        finished.status = UploadStatus::Done;
        self.repo.insert_upload(finished);
        futures::stream::iter(vec![Ok(raw_detection("ABC123", 0.9, 0))]).boxed()
    }
}

#[tokio::test]
async fn test_refused_terminal_transition_reports_skipped() {
    let harness = Harness::new();
    let upload = pending_upload("videos/raced.mp4");
    harness.seed_upload(&upload).await;

    let backend = RacingDetector {
        repo: harness.repo.clone(),
        upload: upload.clone(),
    };
    let processor = harness.processor(anpr_pipeline::detector::DetectorAdapter::new(
        Box::new(backend),
        0.7,
    ));

    let outcome = processor.process(&job_for(&upload)).await.unwrap();
    assert_eq!(outcome, JobOutcome::Skipped);

    let stored = harness.repo.upload(upload.id).unwrap();
    assert_eq!(stored.status, UploadStatus::Done);
    assert_eq!(stored.events_detected, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_remote_batches_frames_with_bearer_token() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = stub_ffmpeg(dir.path(), 5);
    let video = dir.path().join("gate.mp4");
    std::fs::write(&video, b"not really a video").unwrap();

    let (remote_url, batches) = spawn_remote_inference().await;
    let config = DetectorConfig {
        backend: "remote".to_string(),
        remote_url: Some(remote_url),
        remote_token: Some("tok".to_string()),
        remote_batch_size: 2,
        ffmpeg_path: ffmpeg.to_string_lossy().into_owned(),
        ..offline_detector_config(0)
    };

    let backend = detector::build_backend(detector::BackendKind::Remote, &config)
        .await
        .unwrap();
    assert_eq!(backend.name(), "remote");

    let detections: Vec<_> = backend
        .detect(&video, Some(CAMERA_ID))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let frames: Vec<u64> = detections.iter().map(|d| d.frame_no).collect();
    assert_eq!(frames, vec![0, 1, 2, 3, 4]);
    assert!(detections.iter().all(|d| d.crop.is_none()));
    assert!(detections
        .iter()
        .all(|d| d.bbox == BBox::new(10, 20, 110, 60) && d.camera_id.as_deref() == Some(CAMERA_ID)));

    let bearer = Some("Bearer tok".to_string());
    let seen = batches.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            InferenceBatch { files: 2, authorization: bearer.clone() },
            InferenceBatch { files: 2, authorization: bearer.clone() },
            InferenceBatch { files: 1, authorization: bearer },
        ]
    );
}
