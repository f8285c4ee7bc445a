use crate::error::{PipelineError, Result};
use crate::models::{DownloadedFile, ManifestEntry, ValidationStatus};
use crate::utils::hash::{ChecksumAlgorithm, Checksummer, checksums_match};
use crate::utils::validation::{human_readable_size, is_plain_file_name};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// An open response body
pub struct RemoteBody {
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// Where manifest entries are fetched from
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<RemoteBody>;
}

fn transfer_error(url: &str, err: &reqwest::Error) -> PipelineError {
    let transient = match err.status() {
        Some(status) => status.is_server_error() || status.as_u16() == 429,
        None => err.is_timeout() || err.is_connect() || err.is_body() || err.is_request(),
    };
    PipelineError::Transfer {
        url: url.to_string(),
        transient,
        message: err.to_string(),
    }
}

/// HTTP(S) source backed by reqwest
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn open(&self, url: &str) -> Result<RemoteBody> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transfer_error(url, &e))?;

        let content_length = response.content_length();
        let owned_url = url.to_string();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| transfer_error(&owned_url, &e)))
            .boxed();

        Ok(RemoteBody {
            content_length,
            stream,
        })
    }
}

/// Streams an entry into `dest_dir`, hashing while writing.
///
/// Interrupted transfers are re-attempted up to `attempts` times with the
/// partial file removed in between. The returned file carries its
/// validation status; call [`DownloadedFile::ensure_verified`] before use.
pub async fn download(
    source: &dyn RemoteSource,
    entry: &ManifestEntry,
    dest_dir: &Path,
    attempts: u32,
) -> Result<DownloadedFile> {
    if !is_plain_file_name(&entry.file_id) {
        return Err(PipelineError::manifest(
            &entry.file_id,
            "file_id must be a plain file name",
        ));
    }
    let algorithm = ChecksumAlgorithm::detect(&entry.md5).ok_or_else(|| {
        PipelineError::manifest(
            &entry.file_id,
            format!("unsupported checksum '{}'", entry.md5),
        )
    })?;

    let output_path = dest_dir.join(&entry.file_id);
    if let Some(size) = entry.size {
        tracing::info!(
            "⬇️  Downloading {} (size: {})",
            entry.url,
            human_readable_size(size)
        );
    } else {
        tracing::info!("⬇️  Downloading {}", entry.url);
    }

    let attempts = attempts.max(1);
    let mut attempt = 1;
    let (bytes, computed) = loop {
        match fetch_once(source, entry, &output_path, algorithm).await {
            Ok(done) => break done,
            Err(e) => {
                remove_partial(&output_path).await;
                if e.is_transient() && attempt < attempts {
                    tracing::warn!("Download attempt {} failed: {}", attempt, e);
                    tracing::info!(
                        "Retrying download... (attempt {} of {})",
                        attempt + 1,
                        attempts
                    );
                    attempt += 1;
                    continue;
                }
                tracing::error!("All download attempts failed for {}", entry.file_id);
                return Err(e);
            }
        }
    };

    tracing::info!("Successfully downloaded {}", entry.file_id);

    let status = if checksums_match(&entry.md5, &computed) {
        ValidationStatus::Verified
    } else {
        ValidationStatus::Mismatch
    };

    Ok(DownloadedFile {
        file_id: entry.file_id.clone(),
        source_url: entry.url.clone(),
        local_path: output_path,
        bytes,
        expected_checksum: entry.md5.clone(),
        computed_checksum: computed,
        status,
    })
}

async fn fetch_once(
    source: &dyn RemoteSource,
    entry: &ManifestEntry,
    output_path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<(u64, String)> {
    let mut body = source.open(&entry.url).await?;
    let total = body.content_length.or(entry.size).unwrap_or(0);

    let mut file = tokio::fs::File::create(output_path).await?;
    let mut hasher = Checksummer::new(algorithm);
    let mut downloaded: u64 = 0;
    let mut last_percentage = 0;

    while let Some(chunk) = body.stream.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;

        if total > 0 {
            let percentage = downloaded.saturating_mul(100) / total;
            if percentage >= last_percentage + 10 {
                tracing::info!("Download progress: {}%", percentage);
                last_percentage = percentage;
            }
        }
    }

    file.flush().await?;
    Ok((downloaded, hasher.finalize_hex()))
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove partial download {:?}: {}", path, e);
        }
    }
}

impl DownloadedFile {
    /// Passes verified files through; a mismatched file is deleted and
    /// reported as [`PipelineError::ChecksumMismatch`]
    pub async fn ensure_verified(self) -> Result<Self> {
        tracing::info!("Verifying checksum for {}", self.file_id);
        match self.status {
            ValidationStatus::Verified => {
                tracing::info!("Checksum verified: {}", self.computed_checksum);
                Ok(self)
            }
            ValidationStatus::Mismatch => {
                remove_partial(&self.local_path).await;
                Err(PipelineError::ChecksumMismatch {
                    file_id: self.file_id,
                    expected: self.expected_checksum,
                    actual: self.computed_checksum,
                })
            }
        }
    }
}
