//! RabbitMQ delivers jobs; Redis holds job state and fans out lifecycle events.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::Consumer;
use redis::{AsyncCommands, Script};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::{BrokerError, Delivery, EventStream, JobBroker};
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::redis::client::RedisService;
use crate::modules::jobs::model::{JobDescriptor, JobEvent, JobId, JobOutcome, JobState, JobStatus};

pub const QUEUE_NAME: &str = "transcoding_tasks";
const CONSUMER_TAG: &str = "transcoder_worker";
const EVENT_PATTERN: &str = "transcode:events:*";
const TERMINAL_RETRY_DELAY: Duration = Duration::from_millis(500);

const ADVANCE_PROGRESS: &str = r"
local state = redis.call('HGET', KEYS[1], 'state')
if not state or state == 'completed' or state == 'failed' then return 0 end
local current = tonumber(redis.call('HGET', KEYS[1], 'progress') or '0')
if tonumber(ARGV[1]) <= current then return 0 end
redis.call('HSET', KEYS[1], 'progress', ARGV[1], 'updated_at', ARGV[2])
return 1
";

const FINISH_JOB: &str = r"
local state = redis.call('HGET', KEYS[1], 'state')
if not state or state == 'completed' or state == 'failed' then return 0 end
redis.call('HSET', KEYS[1], 'state', ARGV[1], 'reason', ARGV[2], 'updated_at', ARGV[3])
return 1
";

fn job_key(id: &JobId) -> String {
    format!("transcode:job:{}", id)
}

fn event_channel(id: &JobId) -> String {
    format!("transcode:events:{}", id)
}

fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn status_from_hash(id: &JobId, fields: &HashMap<String, String>) -> Option<JobStatus> {
    let state = JobState::parse(fields.get("state")?)?;
    let updated_at = fields
        .get("updated_at")
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);

    Some(JobStatus {
        id: id.clone(),
        source_key: fields.get("source_key").cloned().unwrap_or_default(),
        state,
        progress: fields
            .get("progress")
            .and_then(|p| p.parse::<u8>().ok())
            .unwrap_or(0),
        reason: fields.get("reason").filter(|r| !r.is_empty()).cloned(),
        updated_at,
    })
}

pub struct QueueBroker {
    queue: RabbitMqService,
    redis: RedisService,
    consumer: Mutex<Option<Consumer>>,
    prefetch: u16,
    advance_progress: Script,
    finish_job: Script,
}

impl QueueBroker {
    /// `prefetch` should match the number of worker slots.
    pub fn new(queue: RabbitMqService, redis: RedisService, prefetch: u16) -> Self {
        Self {
            queue,
            redis,
            consumer: Mutex::new(None),
            prefetch: prefetch.max(1),
            advance_progress: Script::new(ADVANCE_PROGRESS),
            finish_job: Script::new(FINISH_JOB),
        }
    }

    async fn set_active(&self, id: &JobId) -> Result<(), BrokerError> {
        let mut conn = self.redis.get_conn().await?;
        let _: () = conn
            .hset_multiple(
                job_key(id),
                &[
                    ("state", JobState::Active.as_str().to_string()),
                    ("updated_at", now_ts().to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn emit(&self, event: &JobEvent) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.redis.get_conn().await?;
        let _: () = conn.publish(event_channel(&event.job_id), payload).await?;
        Ok(())
    }

    /// Commits the terminal state. True when this call made the transition.
    async fn finish(&self, id: &JobId, outcome: &JobOutcome) -> Result<bool, BrokerError> {
        let mut conn = self.redis.get_conn().await?;
        let transitioned: i32 = self
            .finish_job
            .key(job_key(id))
            .arg(outcome.state().as_str())
            .arg(outcome.reason().unwrap_or_default())
            .arg(now_ts())
            .invoke_async(&mut conn)
            .await?;
        Ok(transitioned == 1)
    }
}

/// Runs `op`, and once more after [`TERMINAL_RETRY_DELAY`] if it failed.
async fn retry_once<T, F, Fut>(what: &str, job_id: &JobId, mut op: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("{} for {} failed: {}. Retrying.", what, job_id, e);
            tokio::time::sleep(TERMINAL_RETRY_DELAY).await;
            op().await
        }
    }
}

/// Commits a terminal state, then announces it. Each step is retried on its
/// own, so a commit that landed is never repeated and its event is never lost
/// to a failed publish.
async fn settle<C, CF, A, AF>(job_id: &JobId, commit: C, announce: A) -> Result<(), BrokerError>
where
    C: FnMut() -> CF,
    CF: Future<Output = Result<bool, BrokerError>>,
    A: FnMut() -> AF,
    AF: Future<Output = Result<(), BrokerError>>,
{
    if !retry_once("Terminal state write", job_id, commit).await? {
        debug!("Job {} already terminal, not re-announcing", job_id);
        return Ok(());
    }
    retry_once("Terminal event publish", job_id, announce).await
}

#[async_trait]
impl JobBroker for QueueBroker {
    async fn enqueue(&self, source_key: &str) -> Result<JobId, BrokerError> {
        let id = JobId::generate();

        let mut conn = self.redis.get_conn().await?;
        let _: () = conn
            .hset_multiple(
                job_key(&id),
                &[
                    ("source_key", source_key.to_string()),
                    ("state", JobState::Queued.as_str().to_string()),
                    ("progress", "0".to_string()),
                    ("updated_at", now_ts().to_string()),
                ],
            )
            .await?;

        let payload = serde_json::to_vec(&JobDescriptor {
            id: id.clone(),
            source_key: source_key.to_string(),
        })?;
        self.queue
            .publish(&payload)
            .await
            .map_err(|e| BrokerError::Queue(e.to_string()))?;

        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut guard = self.consumer.lock().await;
        let mut consumer = match guard.take() {
            Some(c) => c,
            None => self
                .queue
                .consume(CONSUMER_TAG, self.prefetch)
                .await
                .map_err(|e| BrokerError::Queue(e.to_string()))?,
        };

        loop {
            // On a consumer error it is dropped, and the next call re-creates it.
            let delivery = match consumer.next().await {
                Some(Ok(d)) => d,
                Some(Err(e)) => return Err(BrokerError::Queue(e.to_string())),
                None => return Ok(None),
            };

            match serde_json::from_slice::<JobDescriptor>(&delivery.data) {
                Ok(job) => {
                    *guard = Some(consumer);
                    self.set_active(&job.id).await?;
                    return Ok(Some(Delivery {
                        job,
                        tag: delivery.delivery_tag,
                    }));
                }
                Err(e) => {
                    // Redelivering a payload we cannot parse would loop forever.
                    error!("❌ Failed to parse job: {}", e);
                    if let Err(e) = self.queue.ack(delivery.delivery_tag).await {
                        error!("Failed to ack message: {}", e);
                    }
                }
            }
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.queue
            .ack(delivery.tag)
            .await
            .map_err(|e| BrokerError::Queue(e.to_string()))
    }

    async fn publish_progress(&self, job_id: &JobId, percent: u8) -> Result<(), BrokerError> {
        let percent = percent.min(100);
        let mut conn = self.redis.get_conn().await?;
        let advanced: i32 = self
            .advance_progress
            .key(job_key(job_id))
            .arg(u32::from(percent))
            .arg(now_ts())
            .invoke_async(&mut conn)
            .await?;

        if advanced == 1 {
            self.emit(&JobEvent::progress(job_id, percent)).await?;
        }
        Ok(())
    }

    async fn publish_terminal(&self, job_id: &JobId, outcome: &JobOutcome) -> Result<(), BrokerError> {
        let event = &JobEvent::terminal(job_id, outcome);
        settle(job_id, || self.finish(job_id, outcome), || self.emit(event)).await
    }

    async fn job_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, BrokerError> {
        let mut conn = self.redis.get_conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(job_key(job_id)).await?;
        Ok(status_from_hash(job_id, &fields))
    }

    async fn subscribe(&self) -> Result<EventStream, BrokerError> {
        let mut pubsub = self.redis.get_pubsub().await?;
        pubsub.psubscribe(EVENT_PATTERN).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match serde_json::from_str::<JobEvent>(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Ignoring malformed job event: {}", e);
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}
