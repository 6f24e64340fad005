use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;
mod common;
mod config;
mod docs;
mod infrastructure;
mod modules;
mod pipeline;
mod routes;
mod state;
#[cfg(test)]
mod testing;
mod workers;

use config::settings::{AppConfig, BrokerKind};
use infrastructure::broker::{JobBroker, MemoryBroker, QueueBroker};
use infrastructure::queue::rabbitmq::RabbitMqService;
use infrastructure::redis::client::RedisService;
use infrastructure::storage::StorageClient;
use infrastructure::storage::s3::StorageService;
use modules::notifications::NotificationRouter;
use pipeline::ffmpeg::FfmpegEncoder;
use pipeline::orchestrator::Orchestrator;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting server...");

    let config = AppConfig::new()?;
    info!(
        "Ladder: {}",
        config
            .ladder
            .renditions()
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let broker = connect_broker(&config).await?;

    let s3 = StorageService::new(&config.storage).await;
    let storage = StorageClient::new(Arc::new(s3.clone()));

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("cannot create work dir {}", config.work_dir.display()))?;

    let orchestrator = Arc::new(Orchestrator::new(
        storage.clone(),
        Arc::new(FfmpegEncoder::new(config.ffmpeg_path.clone(), config.ffprobe_path.clone())),
        broker.clone(),
        Arc::new(config.ladder.clone()),
        config.work_dir.clone(),
    ));
    tokio::spawn(workers::transcoder::start_transcoder_worker(
        orchestrator,
        broker.clone(),
        config.worker_concurrency,
    ));

    let notifications = Arc::new(NotificationRouter::new());
    {
        let notifications = notifications.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(e) = notifications.run(broker).await {
                error!("❌ Notification router stopped: {}", e);
            }
        });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let state = AppState::new(config, broker, storage, s3, notifications);
    let app = app::create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn connect_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn JobBroker>> {
    match config.broker {
        BrokerKind::Memory => {
            info!("Using in-memory broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        BrokerKind::Queue => {
            let redis_url = config.redis_url.as_deref().ok_or_else(|| anyhow!("REDIS_URL is required"))?;
            let amqp_url = config.amqp_url.as_deref().ok_or_else(|| anyhow!("AMQP_URL is required"))?;

            let redis = RedisService::new(redis_url).await?;
            let queue = RabbitMqService::new(amqp_url, infrastructure::broker::queue::QUEUE_NAME).await?;
            let prefetch = u16::try_from(config.worker_concurrency).unwrap_or(u16::MAX);
            Ok(Arc::new(QueueBroker::new(queue, redis, prefetch)))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
