use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::warn;
use uuid::Uuid;

/// Video processing job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub upload_id: Uuid,
    pub storage_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
}

/// A dequeued job, holding on to the exact payload so it can be acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: QueuedJob,
    payload: String,
}

impl Delivery {
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Topic-addressed work queue with acknowledgement.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, topic: &str, job: &QueuedJob) -> Result<(), QueueError>;

    /// Wait up to `timeout` for a job. `None` when the queue stayed empty.
    async fn dequeue(&self, topic: &str, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn queue_length(&self, topic: &str) -> Result<u64, QueueError>;

    /// Acknowledge a delivery once its job reached a terminal state.
    async fn complete(&self, topic: &str, delivery: &Delivery) -> Result<(), QueueError>;

    /// Put an unfinished delivery back at the head of the queue.
    async fn release(&self, topic: &str, delivery: &Delivery) -> Result<(), QueueError>;

    /// Move deliveries a previous run left unacknowledged back onto the queue.
    /// Returns how many were moved.
    async fn recover(&self, topic: &str) -> Result<u64, QueueError>;
}

fn processing_key(topic: &str) -> String {
    format!("{}:processing", topic)
}

/// Redis reliable queue: `BRPOPLPUSH` into a per-topic processing list.
pub struct RedisQueue {
    client: redis::Client,
}

impl RedisQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn enqueue(&self, topic: &str, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(topic, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dequeue(&self, topic: &str, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let processing = processing_key(topic);
        let payload: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(topic)
            .arg(&processing)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<QueuedJob>(&payload) {
            Ok(job) => Ok(Some(Delivery { job, payload })),
            Err(e) => {
                // Unparseable payloads would otherwise sit in the processing list forever
                warn!(topic, error = %e, "Discarding malformed job payload");
                conn.lrem::<_, _, ()>(&processing, 1, &payload)
                    .await
                    .map_err(QueueError::Redis)?;
                Err(QueueError::Serialize(e))
            }
        }
    }

    async fn queue_length(&self, topic: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(topic).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn complete(&self, topic: &str, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(processing_key(topic), 1, delivery.payload())
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn release(&self, topic: &str, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        // Consumers pop from the right, so RPUSH makes it the next delivery
        redis::pipe()
            .atomic()
            .lrem(processing_key(topic), 1, delivery.payload())
            .ignore()
            .rpush(topic, delivery.payload())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn recover(&self, topic: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let processing = processing_key(topic);
        let mut moved = 0u64;
        loop {
            let payload: Option<String> = conn
                .rpoplpush(&processing, topic)
                .await
                .map_err(QueueError::Redis)?;
            if payload.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }
}

/// In-process queue with the same delivery semantics, for tests and dry runs.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    notify: Notify,
}

#[derive(Default)]
struct MemoryQueueState {
    pending: std::collections::HashMap<String, VecDeque<String>>,
    in_flight: Vec<(String, String)>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries handed out but not yet completed.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Push a raw payload, bypassing serialization.
    pub async fn push_raw(&self, topic: &str, payload: impl Into<String>) {
        let mut state = self.state.lock().await;
        state
            .pending
            .entry(topic.to_string())
            .or_default()
            .push_back(payload.into());
        drop(state);
        self.notify.notify_waiters();
    }

    async fn try_pop(&self, topic: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        let payload = state.pending.get_mut(topic)?.pop_front()?;
        state.in_flight.push((topic.to_string(), payload.clone()));
        Some(payload)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, topic: &str, job: &QueuedJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        self.push_raw(topic, payload).await;
        Ok(())
    }

    async fn dequeue(&self, topic: &str, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(payload) = self.try_pop(topic).await {
                return match serde_json::from_str::<QueuedJob>(&payload) {
                    Ok(job) => Ok(Some(Delivery { job, payload })),
                    Err(e) => {
                        let mut state = self.state.lock().await;
                        state.in_flight.retain(|(t, p)| !(t == topic && *p == payload));
                        Err(QueueError::Serialize(e))
                    }
                };
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn queue_length(&self, topic: &str) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok(state.pending.get(topic).map(|q| q.len() as u64).unwrap_or(0))
    }

    async fn complete(&self, topic: &str, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(pos) = state
            .in_flight
            .iter()
            .position(|(t, p)| t == topic && p == delivery.payload())
        {
            state.in_flight.remove(pos);
        }
        Ok(())
    }

    async fn release(&self, topic: &str, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(pos) = state
            .in_flight
            .iter()
            .position(|(t, p)| t == topic && p == delivery.payload())
        {
            state.in_flight.remove(pos);
        }
        state
            .pending
            .entry(topic.to_string())
            .or_default()
            .push_front(delivery.payload().to_string());
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recover(&self, topic: &str) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let (stranded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.in_flight)
            .into_iter()
            .partition(|(t, _)| t == topic);
        state.in_flight = kept;

        let moved = stranded.len() as u64;
        let pending = state.pending.entry(topic.to_string()).or_default();
        for (_, payload) in stranded {
            pending.push_back(payload);
        }
        drop(state);
        if moved > 0 {
            self.notify.notify_waiters();
        }
        Ok(moved)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(storage_path: &str) -> QueuedJob {
        QueuedJob {
            job_id: Uuid::new_v4(),
            upload_id: Uuid::new_v4(),
            storage_path: storage_path.to_string(),
            camera_id: Some("cam-7".to_string()),
        }
    }

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(job("videos/a.mp4")).unwrap();
        assert_eq!(json["storage_path"], "videos/a.mp4");
        assert_eq!(json["camera_id"], "cam-7");

        let parsed: QueuedJob = serde_json::from_str(&format!(
            r#"{{"job_id":"{}","upload_id":"{}","storage_path":"x.mp4"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        ))
        .unwrap();
        assert!(parsed.camera_id.is_none());
    }

    #[tokio::test]
    async fn test_memory_queue_fifo_and_ack() {
        let queue = MemoryQueue::new();
        let first = job("a.mp4");
        let second = job("b.mp4");
        queue.enqueue("videos", &first).await.unwrap();
        queue.enqueue("videos", &second).await.unwrap();
        assert_eq!(queue.queue_length("videos").await.unwrap(), 2);

        let delivery = queue
            .dequeue("videos", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.job, first);
        assert_eq!(queue.in_flight().await, 1);

        queue.complete("videos", &delivery).await.unwrap();
        assert_eq!(queue.in_flight().await, 0);
        assert_eq!(queue.queue_length("videos").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_queue_empty_times_out() {
        let queue = MemoryQueue::new();
        let result = queue.dequeue("videos", Duration::from_millis(20)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_memory_queue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let producer = queue.clone();
        let expected = job("late.mp4");
        let sent = expected.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue("videos", &sent).await.unwrap();
        });

        let delivery = queue.dequeue("videos", Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(delivery.job, expected);
    }

    #[tokio::test]
    async fn test_memory_queue_release_redelivers_first() {
        let queue = MemoryQueue::new();
        let first = job("a.mp4");
        let second = job("b.mp4");
        queue.enqueue("videos", &first).await.unwrap();
        queue.enqueue("videos", &second).await.unwrap();

        let delivery = queue.dequeue("videos", Duration::from_millis(10)).await.unwrap().unwrap();
        queue.release("videos", &delivery).await.unwrap();
        assert_eq!(queue.in_flight().await, 0);
        assert_eq!(queue.queue_length("videos").await.unwrap(), 2);

        let again = queue.dequeue("videos", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.job, first);
    }

    #[tokio::test]
    async fn test_memory_queue_recover_moves_only_topic() {
        let queue = MemoryQueue::new();
        queue.enqueue("videos", &job("a.mp4")).await.unwrap();
        queue.enqueue("other", &job("b.mp4")).await.unwrap();
        queue.dequeue("videos", Duration::from_millis(10)).await.unwrap().unwrap();
        queue.dequeue("other", Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!(queue.recover("videos").await.unwrap(), 1);
        assert_eq!(queue.in_flight().await, 1);
        assert_eq!(queue.queue_length("videos").await.unwrap(), 1);
        assert_eq!(queue.recover("videos").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_error_and_not_in_flight() {
        let queue = MemoryQueue::new();
        queue.push_raw("videos", "{not json").await;
        assert!(queue.dequeue("videos", Duration::from_millis(10)).await.is_err());
        assert_eq!(queue.in_flight().await, 0);
    }
}
