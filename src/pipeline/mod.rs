//! The transcoding pipeline: one source video in, one HLS package out.

pub mod encoder;
pub mod ffmpeg;
pub mod ladder;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod workspace;

/// Packages live at `<PACKAGE_PREFIX>/<job_id>/...` in the store.
pub const PACKAGE_PREFIX: &str = "hls";
