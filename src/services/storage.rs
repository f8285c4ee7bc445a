use crate::error::{PipelineError, Result, StorageErrorKind};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// An object listed under a prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub e_tag: Option<String>,
    pub size: u64,
}

/// Object body with the ETag of the version that was read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub e_tag: Option<String>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    fn bucket(&self) -> &str;
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>>;
    async fn get_object(&self, key: &str) -> Result<StoredObject>;
    /// Upload a local file, returning the number of bytes sent
    async fn upload_file(&self, key: &str, path: &Path) -> Result<u64>;
    async fn object_exists(&self, key: &str) -> Result<bool>;
}

/// Maps an SDK error onto the pipeline's transient/permanent split
fn classify<E>(key: &str, err: SdkError<E, HttpResponse>) -> PipelineError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageErrorKind::Transient
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or_default();
            if status >= 500
                || status == 429
                || matches!(
                    code,
                    "InvalidPart" | "RequestTimeout" | "SlowDown" | "InternalError"
                )
            {
                StorageErrorKind::Transient
            } else {
                StorageErrorKind::Permanent
            }
        }
        _ => StorageErrorKind::Permanent,
    };
    PipelineError::storage(key, kind, DisplayErrorContext(&err).to_string())
}

pub struct S3Storage {
    client: Client,
    bucket: String,
    multipart_threshold: u64,
    chunk_size: u64,
}

impl S3Storage {
    pub fn new(client: Client, bucket: String) -> Self {
        Self {
            client,
            bucket,
            multipart_threshold: 25 * 1024 * 1024,
            chunk_size: 100 * 1024 * 1024,
        }
    }

    pub fn with_multipart(mut self, threshold: u64, chunk_size: u64) -> Self {
        self.multipart_threshold = threshold;
        self.chunk_size = chunk_size;
        self
    }

    async fn put_whole(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, path: &Path) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                PipelineError::storage(key, StorageErrorKind::Transient, "no upload id returned")
            })?
            .to_string();

        match self.send_parts(key, &upload_id, path).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| classify(key, e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        "Failed to abort multipart upload {} for {}: {}",
                        upload_id,
                        key,
                        DisplayErrorContext(&abort)
                    );
                }
                Err(e)
            }
        }
    }

    async fn send_parts(&self, key: &str, upload_id: &str, path: &Path) -> Result<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(path).await?;
        let chunk_size = self.chunk_size as usize;
        let mut buffer = vec![0u8; chunk_size];
        let mut parts = Vec::new();
        let mut part_number = 1;

        loop {
            let mut n = 0;
            while n < chunk_size {
                let read = file.read(&mut buffer[n..]).await?;
                if read == 0 {
                    break;
                }
                n += read;
            }

            if n == 0 {
                break;
            }

            let res = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .part_number(part_number)
                .send()
                .await
                .map_err(|e| classify(key, e))?;

            tracing::debug!("Uploaded part {} of {} ({} bytes)", part_number, key, n);

            parts.push(
                CompletedPart::builder()
                    .e_tag(res.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }

        Ok(parts)
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut continuation_token = None;

        loop {
            let res = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await
                .map_err(|e| classify(prefix, e))?;

            if let Some(contents) = res.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        objects.push(ObjectSummary {
                            key,
                            e_tag: object.e_tag,
                            size: object.size.unwrap_or(0).max(0) as u64,
                        });
                    }
                }
            }

            if res.is_truncated.unwrap_or(false) {
                continuation_token = res.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(objects)
    }

    async fn get_object(&self, key: &str) -> Result<StoredObject> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        let e_tag = res.e_tag;
        let data = res.body.collect().await.map_err(|e| {
            PipelineError::storage(key, StorageErrorKind::Transient, e.to_string())
        })?;
        Ok(StoredObject {
            data: data.to_vec(),
            e_tag,
        })
    }

    async fn upload_file(&self, key: &str, path: &Path) -> Result<u64> {
        let size = tokio::fs::metadata(path).await?.len();
        if size >= self.multipart_threshold {
            self.put_multipart(key, path).await?;
        } else {
            self.put_whole(key, path).await?;
        }
        Ok(size)
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let res = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => Ok(false),
            Err(e) => Err(classify(key, e)),
        }
    }
}
