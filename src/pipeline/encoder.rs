//! The encoder seam: what the orchestrator asks of ffmpeg.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::pipeline::ladder::{RenditionSpec, SEGMENT_DURATION_SECS};
use crate::pipeline::manifest::RENDITION_MANIFEST_NAME;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder not found at {path}")]
    NotFound { path: PathBuf },

    #[error("encoding failed: {reason}")]
    Failed { reason: String },

    #[error("encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// One rendition's encode: resample, segment, and write a sub-manifest into `output_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u64,
    /// RFC 6381 codec string advertised for this rendition.
    pub codecs: String,
    pub segment_duration_secs: u32,
    /// Keep every segment in the playlist (VOD, no sliding window).
    pub keep_all_segments: bool,
    pub output_dir: PathBuf,
}

impl OutputSpec {
    pub fn for_rendition(rendition: &RenditionSpec, codecs: &str, output_dir: &Path) -> Self {
        Self {
            width: rendition.width,
            height: rendition.height,
            bitrate_bps: rendition.bitrate_bps,
            codecs: codecs.to_string(),
            segment_duration_secs: SEGMENT_DURATION_SECS,
            keep_all_segments: true,
            output_dir: output_dir.to_path_buf(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(RENDITION_MANIFEST_NAME)
    }
}

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Runs one encode to completion. Fractional progress (0.0–100.0) goes to
    /// `progress` without waiting on the receiver; a full or closed channel
    /// never stalls the encode.
    async fn transcode(
        &self,
        input: &Path,
        spec: &OutputSpec,
        progress: mpsc::Sender<f64>,
    ) -> Result<(), EncodeError>;
}
