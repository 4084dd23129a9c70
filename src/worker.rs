//! Queue consumer loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::services::processor::{JobOutcome, JobProcessor, ProcessError};
use crate::services::queue::{QueueError, WorkQueue};

const IDLE_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    processor: JobProcessor,
    topic: String,
    dequeue_timeout: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        processor: JobProcessor,
        topic: impl Into<String>,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            topic: topic.into(),
            dequeue_timeout,
        }
    }

    pub fn processor(&self) -> &JobProcessor {
        &self.processor
    }

    /// Process at most one job.
    ///
    /// Returns `Ok(None)` when nothing arrived within the dequeue timeout.
    /// The delivery is acknowledged once the job reached an outcome; on error
    /// it is released back to the head of the queue.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, WorkerError> {
        let waiting = self.queue.queue_length(&self.topic).await?;
        metrics::gauge!("anpr_queue_size").set(waiting as f64);

        let Some(delivery) = self.queue.dequeue(&self.topic, self.dequeue_timeout).await? else {
            return Ok(None);
        };

        info!(
            job_id = %delivery.job.job_id,
            upload_id = %delivery.job.upload_id,
            storage_path = %delivery.job.storage_path,
            "Job dequeued"
        );

        let outcome = match self.processor.process(&delivery.job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_id = %delivery.job.job_id, error = %e, "Job interrupted, releasing delivery");
                if let Err(release_error) = self.queue.release(&self.topic, &delivery).await {
                    error!(job_id = %delivery.job.job_id, error = %release_error, "Failed to release delivery");
                }
                return Err(e.into());
            }
        };
        self.queue.complete(&self.topic, &delivery).await?;
        debug!(job_id = %delivery.job.job_id, outcome = ?outcome, "Job acknowledged");
        Ok(Some(outcome))
    }

    /// Requeue deliveries a previous run left unacknowledged.
    pub async fn recover(&self) -> Result<u64, WorkerError> {
        let moved = self.queue.recover(&self.topic).await?;
        if moved > 0 {
            warn!(topic = %self.topic, moved, "Requeued unacknowledged deliveries");
        }
        Ok(moved)
    }

    /// Consume jobs until `shutdown` is set. The flag is checked between jobs.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        if let Err(e) = self.recover().await {
            error!(error = %e, "Could not requeue unacknowledged deliveries");
        }

        info!(
            topic = %self.topic,
            backend = self.processor.detector().backend_name(),
            "Worker ready, starting job processing loop"
        );

        while !shutdown.load(Ordering::SeqCst) {
            match self.process_next().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    trace!("No jobs available, sleeping");
                    sleep(IDLE_INTERVAL).await;
                }
                Err(e) => {
                    error!(error = %e, "Error processing job, will retry");
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }

        info!("Shutdown requested, worker stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job processing error: {0}")]
    Process(#[from] ProcessError),
}
