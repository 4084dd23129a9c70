use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::detection::BBox;

/// Human review state of an event. The worker only ever writes `Unreviewed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReviewState {
    Unreviewed,
    Confirmed,
    Corrected,
    Rejected,
}

/// One persisted plate detection tied to an upload and a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub camera_id: Option<String>,
    pub plate: String,
    pub normalized_plate: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub frame_no: i64,
    pub captured_at: DateTime<Utc>,
    pub crop_path: Option<String>,
    pub review_state: ReviewState,
}

/// Insert payload for an event; the repository assigns the id.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub upload_id: Uuid,
    pub camera_id: Option<String>,
    pub plate: String,
    pub normalized_plate: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub frame_no: i64,
    pub captured_at: DateTime<Utc>,
    pub crop_path: Option<String>,
}

impl NewEvent {
    pub fn into_event(self, id: Uuid) -> Event {
        Event {
            id,
            upload_id: self.upload_id,
            camera_id: self.camera_id,
            plate: self.plate,
            normalized_plate: self.normalized_plate,
            confidence: self.confidence,
            bbox: self.bbox,
            frame_no: self.frame_no,
            captured_at: self.captured_at,
            crop_path: self.crop_path,
            review_state: ReviewState::Unreviewed,
        }
    }
}
