use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::Repository;
use crate::models::event::{Event, NewEvent, ReviewState};
use crate::models::upload::{Upload, UploadStatus};
use crate::models::watchlist::{WatchlistEntry, WatchlistMatch};

/// PostgreSQL-backed repository over the `uploads`, `events`, `bolos` and
/// `bolo_matches` tables.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn upload_from_row(row: &PgRow) -> Result<Upload, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<UploadStatus>()
        .map_err(|e| sqlx::Error::Decode(format!("invalid upload status '{}': {}", status_str, e).into()))?;

    Ok(Upload {
        id: row.try_get("id")?,
        camera_id: row.try_get("camera_id")?,
        storage_path: row.try_get("storage_path")?,
        status,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        events_detected: row.try_get("events_detected")?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_upload(&self, upload_id: Uuid) -> Result<Option<Upload>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, camera_id, storage_path, status, started_at, completed_at,
                   events_detected, error_message
            FROM uploads
            WHERE id = $1
            "#,
        )
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(upload_from_row).transpose()
    }

    async fn mark_processing(
        &self,
        upload_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET status = 'processing', started_at = $2
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(upload_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_done(
        &self,
        upload_id: Uuid,
        completed_at: DateTime<Utc>,
        events_detected: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET status = 'done', completed_at = $2, events_detected = $3, error_message = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(upload_id)
        .bind(completed_at)
        .bind(events_detected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        upload_id: Uuid,
        completed_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET status = 'failed', completed_at = $2, error_message = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(upload_id)
        .bind(completed_at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_event(&self, event: NewEvent) -> Result<Event, sqlx::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO events (upload_id, camera_id, plate, normalized_plate, confidence,
                                bbox, frame_no, captured_at, crop_path, review_state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(event.upload_id)
        .bind(&event.camera_id)
        .bind(&event.plate)
        .bind(&event.normalized_plate)
        .bind(event.confidence)
        .bind(Json(event.bbox))
        .bind(event.frame_no)
        .bind(event.captured_at)
        .bind(&event.crop_path)
        .bind(ReviewState::Unreviewed.as_ref())
        .fetch_one(&self.pool)
        .await?;

        let id: Uuid = row.try_get("id")?;
        Ok(event.into_event(id))
    }

    async fn active_watchlist(&self) -> Result<Vec<WatchlistEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, plate_pattern, active, expires_at, notification_webhook
            FROM bolos
            WHERE active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(WatchlistEntry {
                    id: r.try_get("id")?,
                    plate_pattern: r.try_get("plate_pattern")?,
                    active: r.try_get("active")?,
                    expires_at: r.try_get("expires_at")?,
                    notification_webhook: r.try_get("notification_webhook")?,
                })
            })
            .collect()
    }

    async fn insert_watchlist_match(
        &self,
        watchlist_match: &WatchlistMatch,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO bolo_matches (bolo_id, event_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(watchlist_match.bolo_id)
        .bind(watchlist_match.event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

