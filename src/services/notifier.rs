use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

/// JSON body POSTed to a watchlist entry's webhook.
#[derive(Debug, Clone, Serialize)]
pub struct MatchNotification {
    pub bolo_id: Uuid,
    pub event_id: Uuid,
    pub plate: String,
    pub confidence: f32,
    pub captured_at: DateTime<Utc>,
}

/// Outbound webhook client with a bounded per-request timeout.
#[derive(Clone)]
pub struct WebhookNotifier {
    http: Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(NotifyError::Http)?;
        Ok(Self { http })
    }

    /// POST `notification` to `url`. Non-2xx answers count as failures.
    pub async fn send(&self, url: &str, notification: &MatchNotification) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(NotifyError::Http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned status {0}")]
    Status(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_fields() {
        let notification = MatchNotification {
            bolo_id: Uuid::nil(),
            event_id: Uuid::nil(),
            plate: "ABC-123".to_string(),
            confidence: 0.9,
            captured_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_value(&notification).unwrap();
        let mut keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["bolo_id", "captured_at", "confidence", "event_id", "plate"]);
        assert_eq!(json["plate"], "ABC-123");
        assert_eq!(json["captured_at"], "2024-05-01T12:00:00Z");
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_error() {
        let notifier = WebhookNotifier::new(Duration::from_millis(500)).unwrap();
        let notification = MatchNotification {
            bolo_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            plate: "ABC123".to_string(),
            confidence: 0.8,
            captured_at: Utc::now(),
        };
        let result = notifier.send("http://127.0.0.1:9/hook", &notification).await;
        assert!(matches!(result, Err(NotifyError::Http(_))));
    }
}
