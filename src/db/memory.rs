use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Repository;
use crate::models::event::{Event, NewEvent};
use crate::models::upload::{Upload, UploadStatus};
use crate::models::watchlist::{WatchlistEntry, WatchlistMatch};

/// In-process repository with the same transition rules as [`super::PgRepository`].
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    uploads: HashMap<Uuid, Upload>,
    events: Vec<Event>,
    watchlist: Vec<WatchlistEntry>,
    matches: Vec<WatchlistMatch>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep using it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_upload(&self, upload: Upload) {
        self.state().uploads.insert(upload.id, upload);
    }

    pub fn add_watchlist_entry(&self, entry: WatchlistEntry) {
        self.state().watchlist.push(entry);
    }

    pub fn upload(&self, upload_id: Uuid) -> Option<Upload> {
        self.state().uploads.get(&upload_id).cloned()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn events_for(&self, upload_id: Uuid) -> Vec<Event> {
        self.state()
            .events
            .iter()
            .filter(|e| e.upload_id == upload_id)
            .cloned()
            .collect()
    }

    pub fn matches(&self) -> Vec<WatchlistMatch> {
        self.state().matches.clone()
    }

    fn transition(
        &self,
        upload_id: Uuid,
        allowed_from: &[UploadStatus],
        apply: impl FnOnce(&mut Upload),
    ) -> bool {
        let mut state = self.state();
        match state.uploads.get_mut(&upload_id) {
            Some(upload) if allowed_from.contains(&upload.status) => {
                apply(upload);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_upload(&self, upload_id: Uuid) -> Result<Option<Upload>, sqlx::Error> {
        Ok(self.upload(upload_id))
    }

    async fn mark_processing(
        &self,
        upload_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        Ok(self.transition(
            upload_id,
            &[UploadStatus::Pending, UploadStatus::Processing],
            |u| {
                u.status = UploadStatus::Processing;
                u.started_at = Some(started_at);
            },
        ))
    }

    async fn mark_done(
        &self,
        upload_id: Uuid,
        completed_at: DateTime<Utc>,
        events_detected: i32,
    ) -> Result<bool, sqlx::Error> {
        Ok(self.transition(upload_id, &[UploadStatus::Processing], |u| {
            u.status = UploadStatus::Done;
            u.completed_at = Some(completed_at);
            u.events_detected = events_detected;
            u.error_message = None;
        }))
    }

    async fn mark_failed(
        &self,
        upload_id: Uuid,
        completed_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, sqlx::Error> {
        Ok(self.transition(upload_id, &[UploadStatus::Processing], |u| {
            u.status = UploadStatus::Failed;
            u.completed_at = Some(completed_at);
            u.error_message = Some(error_message.to_string());
        }))
    }

    async fn insert_event(&self, event: NewEvent) -> Result<Event, sqlx::Error> {
        let event = event.into_event(Uuid::new_v4());
        self.state().events.push(event.clone());
        Ok(event)
    }

    async fn active_watchlist(&self) -> Result<Vec<WatchlistEntry>, sqlx::Error> {
        Ok(self
            .state()
            .watchlist
            .iter()
            .filter(|e| e.active)
            .cloned()
            .collect())
    }

    async fn insert_watchlist_match(
        &self,
        watchlist_match: &WatchlistMatch,
    ) -> Result<(), sqlx::Error> {
        self.state().matches.push(watchlist_match.clone());
        Ok(())
    }
}
