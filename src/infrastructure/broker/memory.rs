use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::debug;

use super::{BrokerError, Delivery, EventStream, JobBroker};
use crate::modules::jobs::model::{JobDescriptor, JobEvent, JobId, JobOutcome, JobState, JobStatus};

const EVENT_CAPACITY: usize = 1024;

/// Everything in process memory. Used with `BROKER=memory` and in tests.
pub struct MemoryBroker {
    queue_tx: async_channel::Sender<JobDescriptor>,
    queue_rx: async_channel::Receiver<JobDescriptor>,
    jobs: Mutex<HashMap<JobId, JobStatus>>,
    events: broadcast::Sender<JobEvent>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue_tx,
            queue_rx,
            jobs: Mutex::new(HashMap::new()),
            events,
        }
    }

    #[cfg(test)]
    /// Stops delivery; pending and future `dequeue` calls return `None`.
    pub fn close(&self) {
        self.queue_tx.close();
    }

    #[cfg(test)]
    /// Live event subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn update<F>(&self, job_id: &JobId, f: F) -> bool
    where
        F: FnOnce(&mut JobStatus) -> bool,
    {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(job_id) {
            Some(status) => {
                let changed = f(status);
                if changed {
                    status.updated_at = OffsetDateTime::now_utc();
                }
                changed
            }
            None => false,
        }
    }

    fn emit(&self, event: JobEvent) {
        // No receivers is fine; state is kept in `jobs` regardless.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn enqueue(&self, source_key: &str) -> Result<JobId, BrokerError> {
        let id = JobId::generate();
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), JobStatus::queued(id.clone(), source_key));

        self.queue_tx
            .send(JobDescriptor {
                id: id.clone(),
                source_key: source_key.to_string(),
            })
            .await
            .map_err(|_| BrokerError::Queue("queue is closed".to_string()))?;

        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        let Ok(job) = self.queue_rx.recv().await else {
            return Ok(None);
        };
        self.update(&job.id, |status| {
            status.state = JobState::Active;
            true
        });
        Ok(Some(Delivery { job, tag: 0 }))
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        debug!("Acknowledged job {}", delivery.job.id);
        Ok(())
    }

    async fn publish_progress(&self, job_id: &JobId, percent: u8) -> Result<(), BrokerError> {
        let advanced = self.update(job_id, |status| {
            if status.state.is_terminal() || percent <= status.progress {
                return false;
            }
            status.progress = percent.min(100);
            true
        });
        if advanced {
            self.emit(JobEvent::progress(job_id, percent.min(100)));
        }
        Ok(())
    }

    async fn publish_terminal(&self, job_id: &JobId, outcome: &JobOutcome) -> Result<(), BrokerError> {
        let transitioned = self.update(job_id, |status| {
            if status.state.is_terminal() {
                return false;
            }
            status.state = outcome.state();
            status.reason = outcome.reason().map(str::to_string);
            true
        });
        if transitioned {
            self.emit(JobEvent::terminal(job_id, outcome));
        }
        Ok(())
    }

    async fn job_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, BrokerError> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned())
    }

    async fn subscribe(&self) -> Result<EventStream, BrokerError> {
        let rx = self.events.subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Event subscriber lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_dequeue_marks_active() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue("uploads/a.mp4").await.unwrap();

        let delivery = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(delivery.job.id, id);
        assert_eq!(delivery.job.source_key, "uploads/a.mp4");

        let status = broker.job_status(&id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Active);
        assert_eq!(status.progress, 0);
    }

    #[tokio::test]
    async fn test_each_job_is_delivered_once() {
        let broker = MemoryBroker::new();
        broker.enqueue("uploads/a.mp4").await.unwrap();
        broker.enqueue("uploads/b.mp4").await.unwrap();
        broker.close();

        let mut seen = Vec::new();
        while let Some(d) = broker.dequeue().await.unwrap() {
            seen.push(d.job.source_key);
        }
        assert_eq!(seen, vec!["uploads/a.mp4", "uploads/b.mp4"]);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_terminal_is_final() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue("uploads/a.mp4").await.unwrap();
        let mut events = broker.subscribe().await.unwrap();

        broker.publish_progress(&id, 40).await.unwrap();
        broker.publish_progress(&id, 30).await.unwrap();
        broker.publish_terminal(&id, &JobOutcome::Completed).await.unwrap();
        broker
            .publish_terminal(&id, &JobOutcome::Failed { reason: "late".into() })
            .await
            .unwrap();
        broker.publish_progress(&id, 90).await.unwrap();

        assert_eq!(events.next().await.unwrap(), JobEvent::progress(&id, 40));
        assert_eq!(events.next().await.unwrap(), JobEvent::terminal(&id, &JobOutcome::Completed));

        let status = broker.job_status(&id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.progress, 40);
        assert_eq!(status.reason, None);
    }

    #[tokio::test]
    async fn test_unknown_job_status() {
        let broker = MemoryBroker::new();
        assert!(broker.job_status(&JobId::from("nope")).await.unwrap().is_none());
    }
}
