use anyhow::Result;

use super::dto::VideoResponse;
use crate::pipeline::PACKAGE_PREFIX;
use crate::pipeline::manifest::MASTER_MANIFEST_NAME;
use crate::state::AppState;

pub struct VideoService;

impl VideoService {
    /// Every package with a master playlist, ordered by id.
    pub async fn list(state: AppState) -> Result<Vec<VideoResponse>> {
        let mut ids: Vec<String> = state
            .storage
            .list_published(PACKAGE_PREFIX, MASTER_MANIFEST_NAME)
            .await?
            .into_iter()
            .collect();
        ids.sort();

        let base = &state.config.storage.public_base_url;
        Ok(ids
            .into_iter()
            .map(|id| VideoResponse {
                url: playback_url(base, &id),
                id,
            })
            .collect())
    }
}

fn playback_url(base: &str, id: &str) -> String {
    format!("{}/{}/{}/{}", base.trim_end_matches('/'), PACKAGE_PREFIX, id, MASTER_MANIFEST_NAME)
}
