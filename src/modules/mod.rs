pub mod jobs;
pub mod notifications;
pub mod videos;
