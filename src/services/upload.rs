use crate::config::RetryPolicy;
use crate::models::UploadResult;
use crate::services::storage::ObjectStorage;
use std::path::Path;
use tokio::time::sleep;

/// Upload one file, retrying transient failures with exponential backoff.
///
/// Never makes more than `policy.max_attempts` attempts. Permanent errors
/// and exhausted retries both produce a failed [`UploadResult`].
pub async fn upload_with_retry(
    storage: &dyn ObjectStorage,
    path: &Path,
    key: &str,
    policy: &RetryPolicy,
) -> UploadResult {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match storage.upload_file(key, path).await {
            Ok(bytes) => {
                tracing::info!("⬆️  Uploaded {} to {}/{}", path.display(), storage.bucket(), key);
                return UploadResult {
                    key: key.to_string(),
                    success: true,
                    retries: attempt,
                    bytes,
                    error: None,
                };
            }
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    "Upload attempt {} of {} for {} failed: {}; retrying in {:?}",
                    attempt + 1,
                    max_attempts,
                    key,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "❌ Upload of {} failed after {} attempt(s): {}",
                    key,
                    attempt + 1,
                    e
                );
                return UploadResult {
                    key: key.to_string(),
                    success: false,
                    retries: attempt,
                    bytes: 0,
                    error: Some(e.to_string()),
                };
            }
        }
    }
}
