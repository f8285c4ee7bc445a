use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::PipelineError;
use crate::models::{BatchReport, FileOutcome, Manifest, ManifestEntry, RunReport, RunRequest};
use crate::services::archive::prepare_candidates;
use crate::services::fetch::{RemoteSource, download};
use crate::services::storage::ObjectStorage;
use crate::services::upload::upload_with_retry;
use crate::utils::validation::destination_key;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Directory under which each run gets its own scratch directory
    pub scratch_root: PathBuf,
    pub upload_retry: RetryPolicy,
    pub download_attempts: u32,
}

impl From<&PipelineConfig> for PipelineOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            scratch_root: config.run_scratch_root(),
            upload_retry: config.upload_retry.clone(),
            download_attempts: config.download_attempts,
        }
    }
}

/// Download, verify and upload manifest entries, one run at a time
pub struct Pipeline {
    storage: Arc<dyn ObjectStorage>,
    source: Arc<dyn RemoteSource>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        source: Arc<dyn RemoteSource>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            storage,
            source,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Execute a single run inside a fresh scratch directory.
    ///
    /// The scratch directory is removed before returning, whatever the
    /// outcome.
    pub async fn run(&self, request: &RunRequest) -> RunReport {
        let span = tracing::info_span!(
            "run",
            run_key = %request.run_key,
            file_id = %request.entry.file_id,
        );
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: &RunRequest) -> RunReport {
        let started_at = Utc::now();
        let entry = &request.entry;
        tracing::info!(
            "🧬 Processing file {} for sample {}",
            entry.file_id,
            entry.sample_id
        );

        let outcome = match self.create_scratch() {
            Ok(scratch) => {
                let outcome = self.execute(entry, scratch.path()).await;
                let path = scratch.path().to_path_buf();
                match scratch.close() {
                    Ok(()) => tracing::info!("🧹 Cleaned up temporary directory: {}", path.display()),
                    Err(e) => tracing::error!(
                        "Failed to remove temporary directory {}: {}",
                        path.display(),
                        e
                    ),
                }
                outcome
            }
            Err(e) => FileOutcome::DownloadFailed {
                error: format!("failed to create scratch directory: {}", e),
            },
        };

        if outcome.is_success() {
            tracing::info!("✅ Run {} succeeded", request.run_key);
        } else {
            tracing::error!("❌ Run {} failed: {:?}", request.run_key, outcome);
        }

        RunReport {
            run_key: request.run_key.clone(),
            file_id: entry.file_id.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome,
        }
    }

    /// Every entry of the manifest, sequentially; a failed entry does not
    /// stop the rest
    pub async fn run_manifest(&self, manifest: &Manifest) -> BatchReport {
        tracing::info!(
            "📄 Running manifest {} ({} entries)",
            manifest.key,
            manifest.entries.len()
        );
        let mut report = BatchReport {
            manifest_key: manifest.key.clone(),
            runs: Vec::with_capacity(manifest.entries.len()),
        };
        for entry in &manifest.entries {
            let request = RunRequest::from_entry(&manifest.key, entry.clone());
            report.runs.push(self.run(&request).await);
        }
        tracing::info!(
            "Manifest {}: {} succeeded, {} failed",
            manifest.key,
            report.succeeded(),
            report.failed()
        );
        report
    }

    fn create_scratch(&self) -> std::io::Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.options.scratch_root)?;
        tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&self.options.scratch_root)
    }

    async fn execute(&self, entry: &ManifestEntry, scratch: &Path) -> FileOutcome {
        let download_dir = scratch.join("download");
        if let Err(e) = tokio::fs::create_dir_all(&download_dir).await {
            return FileOutcome::DownloadFailed {
                error: e.to_string(),
            };
        }

        let verified = match download(
            self.source.as_ref(),
            entry,
            &download_dir,
            self.options.download_attempts,
        )
        .await
        {
            Ok(file) => file.ensure_verified().await,
            Err(e) => Err(e),
        };

        let file = match verified {
            Ok(file) => file,
            Err(PipelineError::ChecksumMismatch {
                expected, actual, ..
            }) => {
                tracing::error!(
                    "Checksum mismatch for {}. Expected: {}, Got: {}",
                    entry.file_id,
                    expected,
                    actual
                );
                return FileOutcome::ChecksumMismatch { expected, actual };
            }
            Err(e) => {
                return FileOutcome::DownloadFailed {
                    error: e.to_string(),
                };
            }
        };

        let candidates =
            match prepare_candidates(&entry.file_id, &file.local_path, &scratch.join("files")).await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    return FileOutcome::ExtractFailed {
                        error: e.to_string(),
                    };
                }
            };

        if candidates.is_empty() {
            return FileOutcome::ExtractFailed {
                error: format!("{} contains no files", entry.file_id),
            };
        }

        let mut uploads = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let key = destination_key(&entry.path_prefix, &candidate.relative);
            tracing::info!(
                "Uploading {} to {}",
                candidate.relative.display(),
                entry.path_prefix
            );
            let result = upload_with_retry(
                self.storage.as_ref(),
                &candidate.local_path,
                &key,
                &self.options.upload_retry,
            )
            .await;

            if result.success {
                if let Err(e) = tokio::fs::remove_file(&candidate.local_path).await {
                    tracing::warn!("Failed to delete {}: {}", candidate.local_path.display(), e);
                } else {
                    tracing::debug!("Deleted uploaded file: {}", candidate.local_path.display());
                }
            }
            uploads.push(result);
        }

        if uploads.iter().all(|u| u.success) {
            FileOutcome::Uploaded { uploads }
        } else {
            FileOutcome::UploadFailed { uploads }
        }
    }
}
