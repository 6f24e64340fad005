use crate::infrastructure::storage::s3::StorageService;
use anyhow::{anyhow, Result};
use axum::{body::Bytes, extract::multipart::Field};
use tracing::error;

// Minimum part size for S3 is 5MB. We use 6MB to be safe.
const MIN_PART_SIZE: usize = 6 * 1024 * 1024;

pub struct MultipartUploader<'a> {
    storage: &'a StorageService,
    key: String,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    part_number: i32,
    buffer: Vec<u8>,
}

impl<'a> MultipartUploader<'a> {
    pub async fn new(storage: &'a StorageService, key: String, content_type: &str) -> Result<Self> {
        let upload_id = storage
            .create_multipart_upload(&key, content_type)
            .await
            .map_err(|e| anyhow!("Failed to initiate upload: {}", e))?;

        Ok(Self {
            storage,
            key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
        })
    }

    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);

        if self.buffer.len() >= MIN_PART_SIZE {
            self.flush_part().await?;
        }

        Ok(())
    }

    async fn flush_part(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let body = Bytes::from(std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(MIN_PART_SIZE),
        ));

        let part = self
            .storage
            .upload_part(&self.key, &self.upload_id, self.part_number, body)
            .await
            .map_err(|e| anyhow!("Failed to upload part {}: {}", self.part_number, e))?;

        self.parts.push(part);
        self.part_number += 1;

        Ok(())
    }

    pub async fn finish(mut self) -> Result<String> {
        if !self.buffer.is_empty() {
            self.flush_part().await?;
        }

        self.storage
            .complete_multipart_upload(&self.key, &self.upload_id, self.parts)
            .await
            .map_err(|e| anyhow!("Failed to complete upload: {}", e))
    }

    pub async fn abort(&self) -> Result<()> {
        self.storage
            .abort_multipart_upload(&self.key, &self.upload_id)
            .await
            .map_err(|e| anyhow!("Failed to abort upload: {}", e))
    }
}

/// Only source videos are accepted for transcoding.
pub fn is_video_content_type(content_type: &str) -> bool {
    content_type.starts_with("video/")
}

/// Keeps the original name readable inside the key without letting it add path segments.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Streams a multipart field into the store under `key`. Returns the stored key.
pub async fn stream_to_s3(
    storage: &StorageService,
    mut field: Field<'_>,
    key: String,
) -> Result<String> {
    let content_type = field.content_type().unwrap_or("application/octet-stream").to_string();

    if !is_video_content_type(&content_type) {
        return Err(anyhow!("Invalid content type: only video/* allowed"));
    }

    let mut uploader = MultipartUploader::new(storage, key, &content_type).await?;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(c)) => c,
            Ok(None) => break,
            Err(e) => {
                error!("Stream error: {}", e);
                uploader.abort().await?;
                return Err(anyhow!("Stream interrupted"));
            }
        };

        if let Err(e) = uploader.write_chunk(chunk).await {
            error!("Upload error: {}", e);
            uploader.abort().await?;
            return Err(e);
        }
    }

    uploader.finish().await
}
