//! Test helper utilities: in-memory pipeline wiring and throwaway HTTP stubs

use anpr_pipeline::db::{MemoryRepository, Repository};
use anpr_pipeline::detector::{
    self, DetectionStream, DetectorAdapter, DetectorConfig, FallbackPolicy, PlateDetector,
};
use anpr_pipeline::models::detection::RawDetection;
use anpr_pipeline::models::event::{Event, NewEvent};
use anpr_pipeline::models::upload::Upload;
use anpr_pipeline::models::watchlist::{WatchlistEntry, WatchlistMatch};
use anpr_pipeline::services::processor::{JobProcessor, ProcessorSettings};
use anpr_pipeline::services::queue::MemoryQueue;
use anpr_pipeline::services::storage::{LocalStore, ObjectStore};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const VIDEOS_BUCKET: &str = "anpr-videos";
pub const CROPS_BUCKET: &str = "anpr-crops";
pub const TOPIC: &str = "video_processing";

/// Detector config that never touches ffmpeg, so mock frames are synthesized
pub fn offline_detector_config(seed: u64) -> DetectorConfig {
    DetectorConfig {
        ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
        ffprobe_path: "/nonexistent/ffprobe".to_string(),
        mock_seed: Some(seed),
        ..Default::default()
    }
}

/// Replays a fixed list of detections for any video
pub struct ScriptedDetector {
    pub detections: Vec<RawDetection>,
}

impl PlateDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect<'a>(&'a self, _video: &'a Path, _camera_id: Option<&'a str>) -> DetectionStream<'a> {
        futures::stream::iter(self.detections.iter().cloned().map(Ok)).boxed()
    }
}

/// Memory repository whose first `failures` upload lookups time out
pub struct FlakyRepository {
    pub inner: Arc<MemoryRepository>,
    failures: AtomicUsize,
}

impl FlakyRepository {
    pub fn new(inner: Arc<MemoryRepository>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn get_upload(&self, upload_id: Uuid) -> Result<Option<Upload>, sqlx::Error> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(sqlx::Error::PoolTimedOut);
        }
        self.inner.get_upload(upload_id).await
    }

    async fn mark_processing(&self, upload_id: Uuid, started_at: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        self.inner.mark_processing(upload_id, started_at).await
    }

    async fn mark_done(
        &self,
        upload_id: Uuid,
        completed_at: DateTime<Utc>,
        events_detected: i32,
    ) -> Result<bool, sqlx::Error> {
        self.inner.mark_done(upload_id, completed_at, events_detected).await
    }

    async fn mark_failed(
        &self,
        upload_id: Uuid,
        completed_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, sqlx::Error> {
        self.inner.mark_failed(upload_id, completed_at, error_message).await
    }

    async fn insert_event(&self, event: NewEvent) -> Result<Event, sqlx::Error> {
        self.inner.insert_event(event).await
    }

    async fn active_watchlist(&self) -> Result<Vec<WatchlistEntry>, sqlx::Error> {
        self.inner.active_watchlist().await
    }

    async fn insert_watchlist_match(&self, watchlist_match: &WatchlistMatch) -> Result<(), sqlx::Error> {
        self.inner.insert_watchlist_match(watchlist_match).await
    }
}

/// In-memory repository and queue plus a `LocalStore` in a temp directory
pub struct Harness {
    pub repo: Arc<MemoryRepository>,
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<LocalStore>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = LocalStore::new(dir.path().join("storage")).expect("Failed to create store");
        Self {
            repo: Arc::new(MemoryRepository::new()),
            queue: Arc::new(MemoryQueue::new()),
            store: Arc::new(store),
            dir,
        }
    }

    pub fn debug_dir(&self) -> PathBuf {
        self.dir.path().join("debug")
    }

    pub fn settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            videos_bucket: VIDEOS_BUCKET.to_string(),
            crops_bucket: CROPS_BUCKET.to_string(),
            presign_expiry: Duration::from_secs(60),
            webhook_timeout: Duration::from_secs(2),
            debug_frame_dir: Some(self.debug_dir()),
        }
    }

    /// Store a placeholder video for `upload` and register the upload row
    pub async fn seed_upload(&self, upload: &Upload) {
        self.store
            .upload_file(VIDEOS_BUCKET, &upload.storage_path, b"not really a video", "video/mp4")
            .await
            .expect("Failed to store video");
        self.repo.insert_upload(upload.clone());
    }

    pub fn processor(&self, adapter: DetectorAdapter) -> JobProcessor {
        self.processor_with_repo(self.repo.clone(), adapter)
    }

    pub fn processor_with_repo(&self, repo: Arc<dyn Repository>, adapter: DetectorAdapter) -> JobProcessor {
        JobProcessor::new(repo, self.store.clone(), adapter, self.settings())
            .expect("Failed to build processor")
    }

    pub fn scripted_processor(&self, detections: Vec<RawDetection>, threshold: f32) -> JobProcessor {
        let backend = ScriptedDetector { detections };
        self.processor(DetectorAdapter::new(Box::new(backend), threshold))
    }

    pub async fn mock_processor(&self, config: &DetectorConfig) -> JobProcessor {
        let backend = detector::select_backend(config, FallbackPolicy::Mock)
            .await
            .expect("Mock backend must always build");
        self.processor(DetectorAdapter::new(backend, config.confidence_threshold))
    }

    pub fn crop_file(&self, key: &str) -> PathBuf {
        self.store
            .object_path(CROPS_BUCKET, key)
            .expect("Crop key must stay inside the store")
    }
}

/// Serve `router` on an ephemeral localhost port, returning its base URL
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind stub server");
    let addr = listener.local_addr().expect("Stub server has no address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

/// Webhook receiver recording every JSON body it gets
pub async fn spawn_webhook_receiver(status: StatusCode) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let router = Router::new().route(
        "/hook",
        post(move |Json(body): Json<serde_json::Value>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(body);
                status
            }
        }),
    );
    let base = spawn_server(router).await;
    (format!("{}/hook", base), received)
}

/// Remote inference stand-in whose health check answers `status`
pub async fn spawn_remote_detector(status: StatusCode) -> String {
    let router = Router::new().route("/health", get(move || async move { status }));
    spawn_server(router).await
}

/// One `/infer/frames` request as the stub saw it
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceBatch {
    pub files: usize,
    pub authorization: Option<String>,
}

/// Remote inference stand-in: healthy, and answers every batch with one
/// plate per uploaded frame keyed by its batch-relative index
pub async fn spawn_remote_inference() -> (String, Arc<Mutex<Vec<InferenceBatch>>>) {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let router = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route(
            "/infer/frames",
            post(move |headers: HeaderMap, body: Bytes| {
                let sink = sink.clone();
                async move {
                    let body = String::from_utf8_lossy(&body);
                    let files = body.matches("name=\"files\"").count();
                    let authorization = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    sink.lock().unwrap().push(InferenceBatch { files, authorization });

                    let by_frame: serde_json::Map<String, serde_json::Value> = (0..files)
                        .map(|i| {
                            let plate = serde_json::json!([{
                                "plate": format!("RMT{}", i),
                                "confidence": 0.9,
                                "bbox": [10, 20, 110, 60]
                            }]);
                            (i.to_string(), plate)
                        })
                        .collect();
                    Json(serde_json::json!({ "detections_by_frame": by_frame }))
                }
            }),
        );
    let base = spawn_server(router).await;
    (base, batches)
}

/// Shell script standing in for ffmpeg: writes `count` frames next to the
/// output pattern it is given as its last argument
#[cfg(unix)]
pub fn stub_ffmpeg(dir: &Path, count: usize) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = format!(
        "#!/bin/sh\nfor last; do :; done\nout=$(dirname \"$last\")\ni=1\nwhile [ $i -le {} ]; do\n  printf 'jpeg' > \"$out/$(printf 'frame_%06d.jpg' $i)\"\n  i=$((i + 1))\ndone\n",
        count
    );
    let path = dir.join("ffmpeg");
    std::fs::write(&path, script).expect("Failed to write ffmpeg stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to mark ffmpeg stub executable");
    path
}
