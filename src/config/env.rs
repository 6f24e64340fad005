use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    Broker,
    RedisUrl,
    AmqpUrl,
    S3Endpoint,
    S3Bucket,
    S3Region,
    S3AccessKey,
    S3SecretKey,
    PublicBaseUrl,
    WorkDir,
    FfmpegPath,
    FfprobePath,
    WorkerConcurrency,
    RenditionLadder,
    RenditionCodecs,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::Broker => "BROKER",
            EnvKey::RedisUrl => "REDIS_URL",
            EnvKey::AmqpUrl => "AMQP_URL",
            EnvKey::S3Endpoint => "S3_ENDPOINT",
            EnvKey::S3Bucket => "S3_BUCKET",
            EnvKey::S3Region => "S3_REGION",
            EnvKey::S3AccessKey => "AWS_ACCESS_KEY_ID",
            EnvKey::S3SecretKey => "AWS_SECRET_ACCESS_KEY",
            EnvKey::PublicBaseUrl => "PUBLIC_BASE_URL",
            EnvKey::WorkDir => "WORK_DIR",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::FfprobePath => "FFPROBE_PATH",
            EnvKey::WorkerConcurrency => "WORKER_CONCURRENCY",
            EnvKey::RenditionLadder => "RENDITION_LADDER",
            EnvKey::RenditionCodecs => "RENDITION_CODECS",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_opt(key: EnvKey) -> Option<String> {
    env::var(key.as_str()).ok().filter(|v| !v.trim().is_empty())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
