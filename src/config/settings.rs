use std::path::PathBuf;

use thiserror::Error;

use crate::config::env::{self, EnvKey};
use crate::pipeline::ladder::{DEFAULT_CODECS, Ladder, LadderError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("unknown broker kind '{0}' (expected 'queue' or 'memory')")]
    UnknownBroker(String),

    #[error("invalid rendition ladder: {0}")]
    Ladder(#[from] LadderError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerKind {
    /// RabbitMQ delivery with Redis-held job state and events.
    Queue,
    /// Single-process broker, no external services.
    Memory,
}

impl BrokerKind {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "queue" => Ok(BrokerKind::Queue),
            "memory" => Ok(BrokerKind::Memory),
            other => Err(ConfigError::UnknownBroker(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub public_base_url: String,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_port: u16,
    pub broker: BrokerKind,
    pub redis_url: Option<String>,
    pub amqp_url: Option<String>,
    pub storage: StorageConfig,
    pub work_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub worker_concurrency: usize,
    pub ladder: Ladder,
}

fn required(key: EnvKey) -> Result<String, ConfigError> {
    let name = key.as_str();
    env::get_opt(key).ok_or(ConfigError::Missing(name))
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let broker = BrokerKind::parse(&env::get_or(EnvKey::Broker, "queue"))?;

        let (redis_url, amqp_url) = match broker {
            BrokerKind::Queue => (
                Some(required(EnvKey::RedisUrl)?),
                Some(required(EnvKey::AmqpUrl)?),
            ),
            BrokerKind::Memory => (env::get_opt(EnvKey::RedisUrl), env::get_opt(EnvKey::AmqpUrl)),
        };

        let endpoint = required(EnvKey::S3Endpoint)?;
        let bucket = required(EnvKey::S3Bucket)?;
        let public_base_url = env::get_opt(EnvKey::PublicBaseUrl)
            .unwrap_or_else(|| format!("{}/{}", endpoint.trim_end_matches('/'), bucket));

        let storage = StorageConfig {
            endpoint,
            bucket,
            region: env::get_or(EnvKey::S3Region, "us-east-1"),
            access_key: required(EnvKey::S3AccessKey)?,
            secret_key: required(EnvKey::S3SecretKey)?,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        };

        let codecs = env::get_or(EnvKey::RenditionCodecs, DEFAULT_CODECS);
        let ladder = match env::get_opt(EnvKey::RenditionLadder) {
            Some(raw) => Ladder::parse(&raw, &codecs)?,
            None => Ladder::standard(&codecs),
        };

        let work_dir = env::get_opt(EnvKey::WorkDir)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("hls-transcoder"));

        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            broker,
            redis_url,
            amqp_url,
            storage,
            work_dir,
            ffmpeg_path: PathBuf::from(env::get_or(EnvKey::FfmpegPath, "ffmpeg")),
            ffprobe_path: PathBuf::from(env::get_or(EnvKey::FfprobePath, "ffprobe")),
            worker_concurrency: env::get_parsed(EnvKey::WorkerConcurrency, 1usize).max(1),
            ladder,
        })
    }
}

#[cfg(test)]
impl AppConfig {
    pub fn for_tests() -> Self {
        Self {
            server_port: 0,
            broker: BrokerKind::Memory,
            redis_url: None,
            amqp_url: None,
            storage: StorageConfig {
                endpoint: "http://localhost:9000".to_string(),
                bucket: "videos".to_string(),
                region: "us-east-1".to_string(),
                access_key: "minioadmin".to_string(),
                secret_key: "minioadmin".to_string(),
                public_base_url: "http://localhost:9000/videos".to_string(),
            },
            work_dir: std::env::temp_dir().join("hls-transcoder-tests"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            worker_concurrency: 1,
            ladder: Ladder::standard(DEFAULT_CODECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_kind_parse() {
        assert_eq!(BrokerKind::parse("queue").unwrap(), BrokerKind::Queue);
        assert_eq!(BrokerKind::parse(" Memory ").unwrap(), BrokerKind::Memory);
        assert!(matches!(BrokerKind::parse("kafka"), Err(ConfigError::UnknownBroker(k)) if k == "kafka"));
    }
}
