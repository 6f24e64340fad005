use anyhow::{Result, anyhow};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, options::*, types::FieldTable,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One durable work queue. Publishing and consuming use separate channels:
/// deliveries must be acked on the channel that delivered them, and a publish
/// reconnect only replaces the publishing side.
#[derive(Clone)]
pub struct RabbitMqService {
    url: String,
    queue: String,
    conn: Arc<Mutex<Connection>>,
    channel: Arc<Mutex<Channel>>,
    consumer_channel: Arc<Mutex<Option<Channel>>>,
}

impl RabbitMqService {
    async fn connect(url: &str, queue: &str) -> Result<(Connection, Channel)> {
        info!("Connecting to RabbitMQ at {}", url);
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| anyhow!("Failed to create channel: {}", e))?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", queue, e))?;

        info!("✅ Connected to RabbitMQ, queue '{}' ready", queue);
        Ok((conn, channel))
    }

    pub async fn new(url: &str, queue: &str) -> Result<Self> {
        let (conn, channel) = Self::connect(url, queue).await?;

        Ok(Self {
            url: url.to_string(),
            queue: queue.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            channel: Arc::new(Mutex::new(channel)),
            consumer_channel: Arc::new(Mutex::new(None)),
        })
    }

    async fn reconnect(&self) -> Result<()> {
        warn!("RabbitMQ connection dropped, reconnecting...");
        let (conn, channel) = Self::connect(&self.url, &self.queue).await?;
        *self.conn.lock().await = conn;
        *self.channel.lock().await = channel;
        Ok(())
    }

    async fn publish_once(&self, payload: &[u8]) -> Result<()> {
        self.channel
            .lock()
            .await
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish message: {}", e))?
            .await
            .map_err(|e| anyhow!("Failed to confirm publication: {}", e))?;

        Ok(())
    }

    /// Persistent publish; one reconnect-and-retry on failure.
    pub async fn publish(&self, payload: &[u8]) -> Result<()> {
        if let Err(e) = self.publish_once(payload).await {
            warn!("RabbitMQ publish failed: {}. Retrying after reconnect.", e);
            self.reconnect().await?;
            self.publish_once(payload).await?;
        }
        Ok(())
    }

    /// Starts a consumer on a fresh channel that holds at most `prefetch`
    /// unacknowledged deliveries. Deliveries of an earlier consumer can no
    /// longer be acked; the broker requeues them when their channel closes.
    pub async fn consume(&self, consumer_tag: &str, prefetch: u16) -> Result<Consumer> {
        let channel = self
            .conn
            .lock()
            .await
            .create_channel()
            .await
            .map_err(|e| anyhow!("Failed to create consumer channel: {}", e))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set prefetch: {}", e))?;

        let consumer = channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer: {}", e))?;

        *self.consumer_channel.lock().await = Some(channel);
        Ok(consumer)
    }

    /// Acks on the consuming channel.
    pub async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let guard = self.consumer_channel.lock().await;
        let channel = guard.as_ref().ok_or_else(|| anyhow!("No consumer is running"))?;
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to ack message: {}", e))
    }
}
