//! Relational persistence for uploads, events and the watchlist.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::models::event::{Event, NewEvent};
use crate::models::upload::Upload;
use crate::models::watchlist::{WatchlistEntry, WatchlistMatch};

pub mod memory;
pub mod queries;

pub use memory::MemoryRepository;
pub use queries::PgRepository;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Row access needed by the job processor.
///
/// Status transitions are conditional and report whether they applied:
/// `mark_processing` only from PENDING or PROCESSING, `mark_done` and
/// `mark_failed` only from PROCESSING.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_upload(&self, upload_id: Uuid) -> Result<Option<Upload>, sqlx::Error>;

    async fn mark_processing(
        &self,
        upload_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error>;

    async fn mark_done(
        &self,
        upload_id: Uuid,
        completed_at: DateTime<Utc>,
        events_detected: i32,
    ) -> Result<bool, sqlx::Error>;

    async fn mark_failed(
        &self,
        upload_id: Uuid,
        completed_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, sqlx::Error>;

    async fn insert_event(&self, event: NewEvent) -> Result<Event, sqlx::Error>;

    /// Entries with `active = true`. Expiry is left to the caller.
    async fn active_watchlist(&self) -> Result<Vec<WatchlistEntry>, sqlx::Error>;

    async fn insert_watchlist_match(&self, watchlist_match: &WatchlistMatch)
        -> Result<(), sqlx::Error>;
}
