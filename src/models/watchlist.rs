use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Watchlist ("BOLO") entry: a plate regex with optional expiry and webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub id: Uuid,
    pub plate_pattern: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub notification_webhook: Option<String>,
}

impl WatchlistEntry {
    /// An entry with no expiry never expires; one expiring exactly now is still live.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at < now)
    }
}

/// Link between a watchlist entry and the event that matched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchlistMatch {
    pub bolo_id: Uuid,
    pub event_id: Uuid,
}
