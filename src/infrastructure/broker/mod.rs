//! The job broker: queue delivery, job state and lifecycle events.

pub mod memory;
pub mod queue;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::modules::jobs::model::{JobDescriptor, JobEvent, JobId, JobOutcome, JobStatus};

pub use memory::MemoryBroker;
pub use queue::QueueBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue error: {0}")]
    Queue(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed broker payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type EventStream = BoxStream<'static, JobEvent>;

/// A job handed to exactly one worker slot. Acknowledge it once the job reached
/// a terminal state.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: JobDescriptor,
    pub(crate) tag: u64,
}

#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Registers a queued job for an already-stored source blob.
    async fn enqueue(&self, source_key: &str) -> Result<JobId, BrokerError>;

    /// Waits for the next job and marks it active. `None` once the broker is shut down.
    async fn dequeue(&self) -> Result<Option<Delivery>, BrokerError>;

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Best-effort; callers may drop updates.
    async fn publish_progress(&self, job_id: &JobId, percent: u8) -> Result<(), BrokerError>;

    /// Records the terminal state and emits `completed` or `failed`.
    async fn publish_terminal(&self, job_id: &JobId, outcome: &JobOutcome) -> Result<(), BrokerError>;

    async fn job_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, BrokerError>;

    /// Lifecycle events of every job, from now on.
    async fn subscribe(&self) -> Result<EventStream, BrokerError>;
}
