use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use super::model::JobId;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SubmitJobRequest {
    /// Key of a source video already in the store.
    #[validate(length(min = 1, message = "source_key is required"))]
    pub source_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobAccepted {
    pub job_id: JobId,
    pub source_key: String,
}
