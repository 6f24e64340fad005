pub mod client;
pub mod s3;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[cfg(test)]
pub use client::RetryPolicy;
pub use client::StorageClient;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("object store request failed: {0}")]
    Transport(String),

    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw object store access. Every call is a single attempt; retrying is the
/// business of [`StorageClient`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads the file at `local_path`, reading it from the start.
    async fn put_file(&self, local_path: &Path, key: &str) -> Result<(), StorageError>;

    /// Downloads `key` into `local_path`, replacing whatever is there.
    async fn get_file(&self, key: &str, local_path: &Path) -> Result<(), StorageError>;

    /// Every key under `prefix`, in no particular order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Content type for packaged output, keyed on file extension.
pub fn content_type_for(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl".to_string(),
        Some("ts") => "video/mp2t".to_string(),
        _ => mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}
