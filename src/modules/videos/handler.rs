use axum::{extract::State, http::StatusCode, response::IntoResponse};

use super::dto::VideoResponse;
use super::service::VideoService;
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::state::AppState;

/// List transcoded videos
#[utoipa::path(
    get,
    path = "/api/v1/videos",
    responses(
        (status = 200, description = "Published packages", body = ApiResponse<Vec<VideoResponse>>),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Videos"
)]
pub async fn list_videos(State(state): State<AppState>) -> impl IntoResponse {
    match VideoService::list(state).await {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Videos retrieved successfully"), StatusCode::OK).into_response(),
        Err(e) => ApiError::internal(e).into_response(),
    }
}
