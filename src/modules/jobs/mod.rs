use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;

use crate::state::AppState;

pub mod dto;
pub mod handler;
pub mod model;
pub mod service;

/// Largest accepted source upload.
const MAX_UPLOAD_BYTES: usize = 8 * 1024 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(handler::submit_job))
        .route("/jobs/{id}", get(handler::get_job))
        .merge(
            Router::new()
                .route("/uploads", post(handler::upload_video))
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES)),
        )
}
