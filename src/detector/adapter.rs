use std::path::Path;

use async_stream::try_stream;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use super::{canonicalize, DetectorError, PlateDetector};
use crate::models::detection::{Detection, RawDetection};

/// Uniform filter over whichever backend is active.
///
/// Drops detections below the global confidence threshold, recomputes the
/// normalized plate and backfills `camera_id` / `captured_at`.
pub struct DetectorAdapter {
    backend: Box<dyn PlateDetector>,
    confidence_threshold: f32,
}

impl DetectorAdapter {
    pub fn new(backend: Box<dyn PlateDetector>, confidence_threshold: f32) -> Self {
        info!(
            backend = backend.name(),
            threshold = confidence_threshold,
            "Detector adapter initialized"
        );
        Self {
            backend,
            confidence_threshold,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Filtered detections for one video.
    pub fn process_video<'a>(
        &'a self,
        video: &'a Path,
        camera_id: Option<&'a str>,
    ) -> BoxStream<'a, Result<Detection, DetectorError>> {
        info!(
            video = %video.display(),
            camera_id = camera_id.unwrap_or("unknown"),
            backend = self.backend.name(),
            "Processing video"
        );

        let threshold = self.confidence_threshold;
        let mut raw = self.backend.detect(video, camera_id);

        try_stream! {
            while let Some(detection) = raw.try_next().await? {
                if let Some(resolved) = resolve(detection, threshold, camera_id) {
                    yield resolved;
                }
            }
        }
        .boxed()
    }
}

/// Apply the threshold and fill in missing fields.
pub(crate) fn resolve(
    raw: RawDetection,
    threshold: f32,
    camera_id: Option<&str>,
) -> Option<Detection> {
    if raw.confidence.is_nan() || raw.confidence < threshold {
        debug!(
            plate = %raw.plate_text,
            confidence = raw.confidence,
            threshold,
            "Detection below threshold, dropped"
        );
        return None;
    }

    let normalized_plate = canonicalize(&raw.plate_text);
    if let Some(reported) = raw.normalized_plate.as_deref() {
        if reported != normalized_plate {
            debug!(
                reported,
                recomputed = %normalized_plate,
                "Backend normalized plate differs, using recomputed value"
            );
        }
    }

    Some(Detection {
        plate: raw.plate_text,
        normalized_plate,
        confidence: raw.confidence,
        bbox: raw.bbox,
        frame_no: raw.frame_no,
        crop: raw.crop,
        frame: raw.frame,
        camera_id: raw.camera_id.or_else(|| camera_id.map(str::to_string)),
        captured_at: raw.captured_at.unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectionStream;
    use crate::models::detection::BBox;
    use chrono::TimeZone;
    use futures::stream;

    fn raw(plate: &str, confidence: f32) -> RawDetection {
        RawDetection {
            plate_text: plate.to_string(),
            normalized_plate: None,
            confidence,
            bbox: BBox::new(0, 0, 10, 10),
            frame_no: 3,
            crop: None,
            frame: None,
            camera_id: None,
            captured_at: None,
        }
    }

    struct Scripted(Vec<(String, f32)>);

    impl PlateDetector for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn detect<'a>(&'a self, _video: &'a Path, _camera_id: Option<&'a str>) -> DetectionStream<'a> {
            stream::iter(self.0.iter().map(|(p, c)| Ok(raw(p, *c)))).boxed()
        }
    }

    #[test]
    fn test_threshold_inclusive() {
        assert!(resolve(raw("ABC123", 0.7), 0.7, None).is_some());
        assert!(resolve(raw("ABC123", 0.6999), 0.7, None).is_none());
    }

    #[test]
    fn test_nan_confidence_dropped() {
        assert!(resolve(raw("ABC123", f32::NAN), 0.0, None).is_none());
    }

    #[test]
    fn test_backfills_camera_and_time() {
        let detection = resolve(raw("ab-123", 0.9), 0.5, Some("cam-7")).unwrap();
        assert_eq!(detection.camera_id.as_deref(), Some("cam-7"));
        assert_eq!(detection.normalized_plate, "AB123");
    }

    #[test]
    fn test_backend_values_kept() {
        let mut r = raw("XYZ789", 0.9);
        r.camera_id = Some("cam-backend".to_string());
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        r.captured_at = Some(at);
        r.normalized_plate = Some("SOMETHING-ELSE".to_string());

        let detection = resolve(r, 0.5, Some("cam-job")).unwrap();
        assert_eq!(detection.camera_id.as_deref(), Some("cam-backend"));
        assert_eq!(detection.captured_at, at);
        assert_eq!(detection.normalized_plate, "XYZ789");
    }

    #[tokio::test]
    async fn test_adapter_filters_stream() {
        let backend = Scripted(vec![
            ("AAA111".to_string(), 0.95),
            ("BBB222".to_string(), 0.40),
            ("CCC333".to_string(), 0.71),
        ]);
        let adapter = DetectorAdapter::new(Box::new(backend), 0.7);
        let plates: Vec<String> = adapter
            .process_video(Path::new("video.mp4"), None)
            .map_ok(|d| d.plate)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(plates, vec!["AAA111", "CCC333"]);
    }
}
