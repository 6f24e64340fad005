use std::sync::Arc;

use crate::config::settings::AppConfig;
use crate::infrastructure::broker::JobBroker;
use crate::infrastructure::storage::StorageClient;
use crate::infrastructure::storage::s3::StorageService;
use crate::modules::notifications::NotificationRouter;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub broker: Arc<dyn JobBroker>,
    /// Retrying store access used by the pipeline and package listing.
    pub storage: StorageClient,
    /// Direct S3 access for streaming multipart intake.
    pub uploads: StorageService,
    pub notifications: Arc<NotificationRouter>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        broker: Arc<dyn JobBroker>,
        storage: StorageClient,
        uploads: StorageService,
        notifications: Arc<NotificationRouter>,
    ) -> Self {
        Self {
            config,
            broker,
            storage,
            uploads,
            notifications,
        }
    }
}

/// In-memory broker, an empty store, and an S3 client that is never contacted.
#[cfg(test)]
pub async fn test_state() -> AppState {
    use crate::infrastructure::broker::MemoryBroker;
    use crate::testing::KeyListStore;

    let config = AppConfig::for_tests();
    let uploads = StorageService::new(&config.storage).await;
    AppState::new(
        config,
        Arc::new(MemoryBroker::new()),
        StorageClient::new(Arc::new(KeyListStore::new(&[]))),
        uploads,
        Arc::new(NotificationRouter::new()),
    )
}
