//! S3-compatible object store backend using the AWS SDK.
//!
//! One backend instance per (tenancy, credential pair): transfer and archive
//! workers receive access keys in the message envelope, so clients are built
//! on demand by [`S3Provider`].

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, ObjectMeta, ObjectStore, ObjectStoreProvider, StreamingUpload,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Minimum part size for S3 multipart uploads (5 MiB).
/// S3 requires all parts except the last to be at least 5 MB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::S3(Box::new(err))
}

/// S3-compatible object store.
pub struct S3Backend {
    client: Client,
    endpoint: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a backend for a tenancy endpoint with explicit credentials.
    ///
    /// `require_secure` selects https and certificate verification; plain
    /// http endpoints additionally get an HTTP-only client so SDK
    /// initialisation does not depend on native trust roots.
    pub fn connect(
        tenancy: &str,
        access_key: &str,
        secret_key: &str,
        region: Option<String>,
        require_secure: bool,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        let endpoint = normalize_endpoint(tenancy, require_secure);

        let credentials = aws_sdk_s3::config::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "nearline-message",
        );
        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region))
            .credentials_provider(credentials)
            .endpoint_url(&endpoint);

        if endpoint.starts_with("http://") {
            builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
        }
        if force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            endpoint,
        })
    }

    fn map_get_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
            if service_err.raw().status().as_u16() == 404 {
                return StorageError::NotFound(key.to_string());
            }
        }
        map_s3_operation_error(err)
    }
}

/// Normalise a tenancy string into an endpoint URL, defaulting the scheme
/// from the secure-transport toggle.
fn normalize_endpoint(tenancy: &str, require_secure: bool) -> String {
    let lower = tenancy.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        tenancy.to_string()
    } else if require_secure {
        format!("https://{tenancy}")
    } else {
        format!("http://{tenancy}")
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err) => {
                let not_found = matches!(
                    &err,
                    aws_sdk_s3::error::SdkError::ServiceError(se)
                        if se.raw().status().as_u16() == 404
                );
                if !not_found {
                    return Err(map_s3_operation_error(err));
                }
            }
        }
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
                    if service_err.raw().status().as_u16() == 404 {
                        return Ok(false);
                    }
                }
                Err(map_s3_operation_error(err))
            }
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_get_error(e, key))?;

        let last_modified = output
            .last_modified()
            .and_then(|dt| time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok());

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0) as u64,
            last_modified,
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_get_error(e, key))?;

        let reader_stream = ReaderStream::new(output.body.into_async_read());
        use futures::StreamExt;
        Ok(Box::pin(reader_stream.map(|r| r.map_err(StorageError::Io))))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let create_output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = create_output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            bytes_written: 0,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
        }))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(map_s3_operation_error)?;

            for obj in output.contents() {
                if let Some(obj_key) = obj.key() {
                    results.push(obj_key.to_string());
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.client
            .list_buckets()
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }
}

/// Streaming upload using S3 multipart upload. Chunks accumulate in a buffer
/// until the 5 MiB part minimum is reached.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    part_number: i32,
    bytes_written: u64,
    buffer: Vec<u8>,
}

impl S3Upload {
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(self.part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(self.part_number)
                .set_e_tag(output.e_tag().map(|t| t.to_string()))
                .build(),
        );
        self.part_number += 1;
        Ok(())
    }

    async fn abort_upload(&self) {
        // best-effort cleanup; orphaned parts are reaped by bucket policy
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            tracing::warn!(key = %self.key, error = %e, "failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(&data);
        while self.buffer.len() >= MIN_PART_SIZE {
            let part: Vec<u8> = self.buffer.drain(..MIN_PART_SIZE).collect();
            if let Err(e) = self.upload_part(Bytes::from(part)).await {
                self.abort_upload().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        if self.parts.is_empty() {
            // zero or sub-part-size uploads: a multipart upload needs at
            // least one part, so fall back to PutObject
            self.abort_upload().await;
            let body = std::mem::take(&mut self.buffer);
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(Bytes::from(body).into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            return Ok(self.bytes_written);
        }

        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            if let Err(e) = self.upload_part(Bytes::from(tail)).await {
                self.abort_upload().await;
                return Err(e);
            }
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.abort_upload().await;
        Ok(())
    }
}

/// Provider building one client per (tenancy, credentials) message.
pub struct S3Provider {
    region: Option<String>,
    require_secure: bool,
    force_path_style: bool,
}

impl S3Provider {
    pub fn new(region: Option<String>, require_secure: bool, force_path_style: bool) -> Self {
        Self {
            region,
            require_secure,
            force_path_style,
        }
    }
}

#[async_trait]
impl ObjectStoreProvider for S3Provider {
    async fn open(
        &self,
        tenancy: &str,
        access_key: &str,
        secret_key: &str,
    ) -> StorageResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3Backend::connect(
            tenancy,
            access_key,
            secret_key,
            self.region.clone(),
            self.require_secure,
            self.force_path_style,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_scheme_follows_secure_toggle() {
        assert_eq!(
            normalize_endpoint("tenancy.example", true),
            "https://tenancy.example"
        );
        assert_eq!(
            normalize_endpoint("tenancy.example:9000", false),
            "http://tenancy.example:9000"
        );
        assert_eq!(
            normalize_endpoint("https://tenancy.example", false),
            "https://tenancy.example"
        );
    }
}
