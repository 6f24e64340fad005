use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema, PartialEq, Eq)]
pub struct VideoResponse {
    pub id: String,
    /// Master playlist URL.
    pub url: String,
}
