use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle of an uploaded video.
///
/// Transitions are monotonic: PENDING -> PROCESSING -> DONE | FAILED.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Done | UploadStatus::Failed)
    }
}

/// One submitted video and its processing lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub id: Uuid,
    pub camera_id: Option<String>,
    pub storage_path: String,
    pub status: UploadStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub events_detected: i32,
    pub error_message: Option<String>,
}
