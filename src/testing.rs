//! Shared test doubles.

use std::path::Path;

use async_trait::async_trait;

use crate::infrastructure::storage::{ObjectStore, StorageError};

/// A store that only knows a fixed set of keys and refuses transfers.
pub struct KeyListStore {
    keys: Vec<String>,
}

impl KeyListStore {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[async_trait]
impl ObjectStore for KeyListStore {
    async fn put_file(&self, _local_path: &Path, key: &str) -> Result<(), StorageError> {
        Err(StorageError::Transport(format!("read-only store, refused {key}")))
    }

    async fn get_file(&self, key: &str, _local_path: &Path) -> Result<(), StorageError> {
        Err(StorageError::NotFound { key: key.to_string() })
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.keys.iter().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}
