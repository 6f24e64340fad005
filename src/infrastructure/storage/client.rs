use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{ObjectStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Storage as the pipeline sees it: retried uploads, single-shot downloads and
/// package discovery.
#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl StorageClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_retry(store, RetryPolicy::default())
    }

    pub fn with_retry(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Uploads with bounded retries. Each attempt re-opens the file; the last
    /// attempt's error is returned once the budget is spent.
    pub async fn put(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.store.put_file(local_path, key).await {
                Ok(()) => {
                    info!("☁️  Uploaded {}", key);
                    return Ok(());
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        "⚠️  Upload failed (attempt {}/{}) for {}: {}",
                        attempt, max_attempts, key, e
                    );
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("⚠️  Giving up on {} after {} attempts: {}", key, attempt, e);
                    return Err(e);
                }
            }
        }
    }

    /// Downloads once. There is nothing useful to retry into, so errors propagate as-is.
    pub async fn get(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        info!("⬇️  Downloading {}", key);
        self.store.get_file(key, local_path).await
    }

    /// Distinct first path segments below `prefix`, e.g. `hls/` + `a/master.m3u8` → `a`.
    #[cfg(test)]
    pub async fn list_packages(&self, prefix: &str) -> Result<HashSet<String>, StorageError> {
        let prefix = package_root(prefix);
        let keys = self.store.list_keys(&prefix).await?;
        Ok(package_ids(&prefix, &keys).map(str::to_string).collect())
    }

    /// Packages below `prefix` that hold `manifest` at their root. Failed jobs
    /// leave renditions without a master playlist; those are left out.
    pub async fn list_published(&self, prefix: &str, manifest: &str) -> Result<HashSet<String>, StorageError> {
        let prefix = package_root(prefix);
        let keys = self.store.list_keys(&prefix).await?;
        let present: HashSet<&str> = keys.iter().map(String::as_str).collect();

        Ok(package_ids(&prefix, &keys)
            .filter(|id| present.contains(format!("{}{}/{}", prefix, id, manifest).as_str()))
            .map(str::to_string)
            .collect())
    }
}

fn package_root(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

fn package_ids<'a>(prefix: &'a str, keys: &'a [String]) -> impl Iterator<Item = &'a str> {
    keys.iter()
        .filter_map(move |key| key.strip_prefix(prefix))
        .filter_map(|rest| rest.split('/').next())
        .filter(|id| !id.is_empty())
}
