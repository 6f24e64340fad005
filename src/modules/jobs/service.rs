use anyhow::{Result, anyhow};
use tracing::info;
use uuid::Uuid;

use super::dto::JobAccepted;
use super::model::{JobId, JobStatus};
use crate::common::upload::sanitize_filename;
use crate::state::AppState;

/// Raw uploads land under this prefix before being transcoded.
pub const UPLOAD_PREFIX: &str = "uploads";

pub struct JobService;

impl JobService {
    pub async fn submit(state: AppState, source_key: &str) -> Result<JobAccepted> {
        let source_key = source_key.trim();
        if source_key.is_empty() {
            return Err(anyhow!("source_key is required"));
        }

        let job_id = state.broker.enqueue(source_key).await?;
        info!("📥 Queued job {} for {}", job_id, source_key);

        Ok(JobAccepted {
            job_id,
            source_key: source_key.to_string(),
        })
    }

    pub async fn status(state: AppState, id: &JobId) -> Result<Option<JobStatus>> {
        Ok(state.broker.job_status(id).await?)
    }

    /// `uploads/<uuid>-<name>`: unique per upload, still recognizable.
    pub fn upload_key(file_name: &str) -> String {
        format!("{}/{}-{}", UPLOAD_PREFIX, Uuid::new_v4(), sanitize_filename(file_name))
    }
}
