//! Construct the configured detector and optionally run it over one video.
//!
//! Usage: `detector_smoketest [VIDEO_PATH]`

use anpr_pipeline::{
    config::AppConfig,
    detector::{self, BackendKind, DetectorAdapter},
};
use futures::TryStreamExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let detector_config = config.detector_config();

    println!("detector backend:     {}", detector_config.backend);
    println!("confidence threshold: {}", detector_config.confidence_threshold);
    println!("backend threshold:    {}", detector_config.backend_threshold);
    println!("frame fps:            {}", detector_config.fps);
    println!("device:               {}", detector_config.device);
    println!(
        "min box:              {}x{}",
        detector_config.min_box_width, detector_config.min_box_height
    );
    println!(
        "remote url:           {}",
        detector_config.remote_url.as_deref().unwrap_or("-")
    );

    let kind = match detector_config.backend.parse::<BackendKind>() {
        Ok(kind) => kind,
        Err(_) => {
            eprintln!("unknown detector backend '{}'", detector_config.backend);
            return ExitCode::FAILURE;
        }
    };

    let backend = match detector::build_backend(kind, &detector_config).await {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("backend construction failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("backend ready:        {}", backend.name());

    let Some(video) = std::env::args().nth(1).map(PathBuf::from) else {
        return ExitCode::SUCCESS;
    };

    let adapter = DetectorAdapter::new(backend, detector_config.confidence_threshold);
    let start = Instant::now();
    let mut detections = adapter.process_video(&video, Some("smoketest"));
    let mut count = 0usize;

    loop {
        match detections.try_next().await {
            Ok(Some(d)) => {
                count += 1;
                println!(
                    "frame {:>6}  {:<12} {:<12} conf={:.3} bbox=({},{},{},{}) crop={}",
                    d.frame_no,
                    d.plate,
                    d.normalized_plate,
                    d.confidence,
                    d.bbox.x1,
                    d.bbox.y1,
                    d.bbox.x2,
                    d.bbox.y2,
                    d.crop.is_some()
                );
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("detection failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    println!(
        "{} detections in {} ms",
        count,
        start.elapsed().as_millis()
    );
    ExitCode::SUCCESS
}
