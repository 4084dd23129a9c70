use std::sync::Arc;

use crate::db::PgRepository;
use crate::services::queue::RedisQueue;

/// Shared state for the worker's ops endpoints.
#[derive(Clone)]
pub struct AppState {
    pub db: PgRepository,
    pub queue: Arc<RedisQueue>,
    /// Name of the detector backend actually in use.
    pub detector_backend: &'static str,
}

impl AppState {
    pub fn new(db: PgRepository, queue: Arc<RedisQueue>, detector_backend: &'static str) -> Self {
        Self {
            db,
            queue,
            detector_backend,
        }
    }
}
