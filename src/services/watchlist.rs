use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use tracing::{error, info, warn};

use super::notifier::{MatchNotification, WebhookNotifier};
use crate::db::Repository;
use crate::models::event::Event;
use crate::models::watchlist::{WatchlistEntry, WatchlistMatch};

/// Entries that are live at `now` and whose pattern matches `normalized_plate`.
///
/// Patterns are case-insensitive and unanchored. An entry whose pattern does
/// not compile is skipped.
pub fn matching_entries<'a>(
    entries: &'a [WatchlistEntry],
    normalized_plate: &str,
    now: DateTime<Utc>,
) -> Vec<&'a WatchlistEntry> {
    entries
        .iter()
        .filter(|entry| entry.active && !entry.is_expired(now))
        .filter(|entry| {
            match RegexBuilder::new(&entry.plate_pattern)
                .case_insensitive(true)
                .build()
            {
                Ok(re) => re.is_match(normalized_plate),
                Err(e) => {
                    warn!(bolo_id = %entry.id, pattern = %entry.plate_pattern, error = %e, "Invalid watchlist pattern, skipping");
                    false
                }
            }
        })
        .collect()
}

/// Evaluates persisted events against the watchlist and fires webhooks.
pub struct WatchlistMatcher {
    repo: Arc<dyn Repository>,
    notifier: WebhookNotifier,
}

impl WatchlistMatcher {
    pub fn new(repo: Arc<dyn Repository>, notifier: WebhookNotifier) -> Self {
        Self { repo, notifier }
    }

    /// Record a match for every live entry matching `event`, then notify.
    ///
    /// Repository errors propagate; webhook failures are logged and counted only.
    pub async fn check_event(&self, event: &Event) -> Result<Vec<WatchlistMatch>, sqlx::Error> {
        let entries = self.repo.active_watchlist().await?;
        let now = Utc::now();
        let mut recorded = Vec::new();

        for entry in matching_entries(&entries, &event.normalized_plate, now) {
            let watchlist_match = WatchlistMatch {
                bolo_id: entry.id,
                event_id: event.id,
            };
            self.repo.insert_watchlist_match(&watchlist_match).await?;
            metrics::counter!("anpr_watchlist_matches").increment(1);

            warn!(
                bolo_id = %entry.id,
                event_id = %event.id,
                plate = %event.plate,
                "Watchlist match detected"
            );

            if let Some(url) = entry.notification_webhook.as_deref() {
                self.notify(entry, event, url).await;
            }
            recorded.push(watchlist_match);
        }

        Ok(recorded)
    }

    async fn notify(&self, entry: &WatchlistEntry, event: &Event, url: &str) {
        let notification = MatchNotification {
            bolo_id: entry.id,
            event_id: event.id,
            plate: event.plate.clone(),
            confidence: event.confidence,
            captured_at: event.captured_at,
        };

        match self.notifier.send(url, &notification).await {
            Ok(()) => info!(bolo_id = %entry.id, "Watchlist webhook sent"),
            Err(e) => {
                metrics::counter!("anpr_webhook_failures").increment(1);
                error!(bolo_id = %entry.id, error = %e, "Failed to send watchlist notification");
            }
        }
    }
}
