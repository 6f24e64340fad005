use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{Client, config::BehaviorVersion, config::Credentials, config::Region};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{ObjectStore, StorageError, content_type_for};
use crate::config::settings::StorageConfig;

fn transport<E: std::error::Error>(context: &str, err: E) -> StorageError {
    StorageError::Transport(format!("{}: {}", context, DisplayErrorContext(err)))
}

#[derive(Clone)]
pub struct StorageService {
    pub client: Client,
    pub bucket: String,
}

impl StorageService {
    pub async fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "static",
        );

        let s3_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO
            .build();

        let client = Client::from_conf(s3_config);

        info!("✅ Connected to S3 ({})", config.endpoint);

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }

    pub async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let result = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| transport("create multipart upload", e))?;

        result
            .upload_id
            .ok_or_else(|| StorageError::Transport("store returned no upload id".to_string()))
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: bytes::Bytes,
    ) -> Result<CompletedPart, StorageError> {
        let result = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| transport("upload part", e))?;

        Ok(CompletedPart::builder()
            .set_e_tag(result.e_tag)
            .part_number(part_number)
            .build())
    }

    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<String, StorageError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| transport("complete multipart upload", e))?;

        Ok(key.to_string())
    }

    pub async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| transport("abort multipart upload", e))?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn put_file(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        // A new ByteStream per call, so a retry never resumes a drained reader.
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| transport(&format!("read {}", local_path.display()), e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(local_path))
            .body(body)
            .send()
            .await
            .map_err(|e| transport("put object", e))?;

        Ok(())
    }

    async fn get_file(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound { key: key.to_string() }
                } else {
                    transport("get object", e)
                }
            })?;

        let mut reader = Box::pin(resp.body.into_async_read());
        let mut file = tokio::fs::File::create(local_path).await?;
        let bytes = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        info!("⬇️  Downloaded {} bytes from {}", bytes, key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| transport("list objects", e))?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(str::to_string),
            );

            match page.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }
}
