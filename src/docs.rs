use utoipa::OpenApi;

use crate::modules::jobs::dto::{JobAccepted, SubmitJobRequest};
use crate::modules::jobs::model::{JobId, JobState, JobStatus};
use crate::modules::videos::dto::VideoResponse;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::jobs::handler::submit_job,
        crate::modules::jobs::handler::get_job,
        crate::modules::jobs::handler::upload_video,
        crate::modules::videos::handler::list_videos,
    ),
    components(
        schemas(SubmitJobRequest, JobAccepted, JobId, JobState, JobStatus, VideoResponse)
    ),
    tags(
        (name = "Jobs", description = "Transcoding intake and status"),
        (name = "Videos", description = "Published HLS packages")
    )
)]
pub struct ApiDoc;
