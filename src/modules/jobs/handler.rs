use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{info, warn};
use validator::Validate;

use super::dto::{JobAccepted, SubmitJobRequest};
use super::model::{JobId, JobStatus};
use super::service::JobService;
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::common::upload::{is_video_content_type, stream_to_s3};
use crate::state::AppState;

/// Queue a transcode for a video already in the store
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 201, description = "Job queued", body = ApiResponse<JobAccepted>),
        (status = 400, description = "Bad Request"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Jobs"
)]
pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    if let Err(e) = req.validate() {
        return ApiError::bad_request(e.to_string()).into_response();
    }

    match JobService::submit(state, &req.source_key).await {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Job queued"), StatusCode::CREATED).into_response(),
        Err(e) => ApiError::internal(e).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    params(
        ("id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = ApiResponse<JobStatus>),
        (status = 404, description = "Job Not Found"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Jobs"
)]
pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match JobService::status(state, &JobId(id)).await {
        Ok(Some(status)) => {
            ApiSuccess(ApiResponse::success(status, "Job retrieved successfully"), StatusCode::OK).into_response()
        }
        Ok(None) => ApiError::not_found("Job not found").into_response(),
        Err(e) => ApiError::internal(e).into_response(),
    }
}

/// Upload a source video and queue it
/// The `video` field is streamed straight to the object store.
#[utoipa::path(
    post,
    path = "/api/v1/uploads",
    request_body(content = String, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Uploaded and queued", body = ApiResponse<JobAccepted>),
        (status = 400, description = "Bad Request"),
        (status = 415, description = "Not a video"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Jobs"
)]
pub async fn upload_video(State(state): State<AppState>, mut multipart: Multipart) -> impl IntoResponse {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return ApiError::bad_request(format!("Malformed multipart body: {}", e)).into_response(),
        };

        if field.name() != Some("video") {
            continue;
        }

        if !is_video_content_type(field.content_type().unwrap_or_default()) {
            return ApiError("Only video uploads are accepted".to_string(), StatusCode::UNSUPPORTED_MEDIA_TYPE)
                .into_response();
        }

        let file_name = field.file_name().unwrap_or("video.mp4").to_string();
        let key = JobService::upload_key(&file_name);
        info!("⬆️  Receiving upload {} as {}", file_name, key);

        if let Err(e) = stream_to_s3(&state.uploads, field, key.clone()).await {
            warn!("Upload of {} failed: {}", key, e);
            return ApiError::internal(format!("Upload failed: {}", e)).into_response();
        }

        return match JobService::submit(state, &key).await {
            Ok(res) => ApiSuccess(ApiResponse::success(res, "Video uploaded and queued"), StatusCode::CREATED)
                .into_response(),
            Err(e) => ApiError::internal(e).into_response(),
        };
    }

    ApiError::bad_request("No video field found in multipart request").into_response()
}

#[cfg(test)]
mod tests {
    use crate::modules::jobs::model::JobState;
    use crate::state::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_status() {
        let state = test_state().await;
        let app = crate::app::create_app(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/jobs", r#"{"source_key":"uploads/clip.mp4"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(Request::get(format!("/api/v1/jobs/{job_id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["state"], JobState::Queued.as_str());
        assert_eq!(body["data"]["progress"], 0);
        assert_eq!(body["data"]["source_key"], "uploads/clip.mp4");
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_key() {
        let app = crate::app::create_app(test_state().await);
        let response = app
            .oneshot(post_json("/api/v1/jobs", r#"{"source_key":""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "error");
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let app = crate::app::create_app(test_state().await);
        let response = app
            .oneshot(Request::get("/api/v1/jobs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_rejects_non_video() {
        let app = crate::app::create_app(test_state().await);
        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"video\"; filename=\"a.png\"\r\n\
             Content-Type: image/png\r\n\r\nPNGDATA\r\n--{boundary}--\r\n"
        );
        let request = Request::post("/api/v1/uploads")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
}
