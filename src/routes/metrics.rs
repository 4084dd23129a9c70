use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the worker emits.
pub fn describe_worker_metrics() {
    metrics::describe_counter!("anpr_jobs_processed", "Jobs that reached DONE");
    metrics::describe_counter!("anpr_jobs_failed", "Jobs that reached FAILED");
    metrics::describe_counter!("anpr_events_processed", "Plate events persisted");
    metrics::describe_counter!("anpr_watchlist_matches", "Watchlist matches recorded");
    metrics::describe_counter!("anpr_webhook_failures", "Watchlist webhooks that could not be delivered");
    metrics::describe_counter!(
        "anpr_detector_fallbacks",
        "Times the configured detector was replaced by the mock backend"
    );
    metrics::describe_gauge!("anpr_queue_size", "Jobs waiting in the work queue");
    metrics::describe_histogram!(
        "anpr_job_processing_seconds",
        "Time from PROCESSING to a terminal state"
    );
}
