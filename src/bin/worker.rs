use anpr_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgRepository},
    detector::{self, DetectorAdapter},
    routes::{self, metrics::describe_worker_metrics},
    services::{
        processor::{JobProcessor, ProcessorSettings},
        queue::RedisQueue,
        storage,
    },
    worker::Worker,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting ANPR worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_worker_metrics();

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let repo = PgRepository::new(db_pool);

    // Initialize services
    tracing::info!("Initializing services");
    let queue = Arc::new(RedisQueue::new(&config.redis_url).expect("Failed to initialize job queue"));
    let store = storage::from_config(&config).expect("Failed to initialize object storage");

    let detector_config = config.detector_config();
    let backend = detector::select_backend(&detector_config, config.fallback_policy())
        .await
        .expect("No detector backend available");
    let adapter = DetectorAdapter::new(backend, detector_config.confidence_threshold);
    let backend_name = adapter.backend_name();

    let processor = JobProcessor::new(
        Arc::new(repo.clone()),
        store,
        adapter,
        ProcessorSettings::from_config(&config),
    )
    .expect("Failed to initialize job processor");

    // Ops listener
    let state = AppState::new(repo, queue.clone(), backend_name);
    let app = routes::ops_router(state, prometheus_handle);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind ops listener");
    tracing::info!(addr = %config.bind_addr, "Ops listener started");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Ops listener stopped");
        }
    });

    // Finish the current job, then exit
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let worker = Worker::new(
        queue,
        processor,
        config.queue_topic.clone(),
        config.dequeue_timeout(),
    );
    worker.run(shutdown).await;
}
