use crate::error::Result;
use crate::models::{ManifestIdentity, RunRequest};
use crate::services::ledger::RunLedger;
use crate::services::manifest::load_manifest;
use crate::services::storage::ObjectStorage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};

/// Polls the bucket for new `.tsv` manifests and turns their entries into
/// run requests
pub struct Sensor {
    storage: Arc<dyn ObjectStorage>,
    ledger: Arc<dyn RunLedger>,
    prefix: String,
    interval: Duration,
}

impl Sensor {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        ledger: Arc<dyn RunLedger>,
        prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            storage,
            ledger,
            prefix: prefix.into(),
            interval,
        }
    }

    /// One evaluation: every run request not issued before.
    ///
    /// A manifest that cannot be read or parsed is skipped and left
    /// unrecorded, so a corrected upload is picked up on a later tick.
    /// When the ledger cannot be written the evaluation stops early but
    /// still returns every request it already claimed.
    pub async fn tick(&self) -> Result<Vec<RunRequest>> {
        tracing::info!(
            "Bucket: {}, manifest prefix: {}",
            self.storage.bucket(),
            self.prefix
        );

        let manifests: Vec<_> = self
            .storage
            .list_objects(&self.prefix)
            .await?
            .into_iter()
            .filter(|o| o.key.ends_with(".tsv"))
            .collect();
        tracing::info!("Found {} manifest files", manifests.len());

        let mut requests = Vec::new();
        for object in manifests {
            let listed = ManifestIdentity {
                key: object.key.clone(),
                e_tag: object.e_tag.clone(),
            };
            if self.ledger.manifest_seen(&listed) {
                tracing::debug!("Manifest {} already processed", object.key);
                continue;
            }

            tracing::info!("Processing manifest file: {}", object.key);
            let manifest = match load_manifest(self.storage.as_ref(), &object.key).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::error!("Error processing manifest file {}: {}", object.key, e);
                    continue;
                }
            };
            // The version actually read, which may be newer than the listing
            let identity = ManifestIdentity {
                key: object.key.clone(),
                e_tag: manifest.e_tag.clone().or(object.e_tag),
            };

            let mut issued = 0;
            for entry in manifest.entries.iter().cloned() {
                let request = RunRequest::from_entry(&manifest.key, entry);
                match self.ledger.claim_run(&request) {
                    Ok(true) => {
                        tracing::info!("Created run request for file {}", request.entry.file_id);
                        requests.push(request);
                        issued += 1;
                    }
                    Ok(false) => {
                        tracing::info!("Skipping {}: run key already issued", request.run_key);
                    }
                    Err(e) => {
                        tracing::error!(
                            "Failed to claim {}: {}; manifest {} will be re-read",
                            request.run_key,
                            e,
                            manifest.key
                        );
                        return Ok(requests);
                    }
                }
            }

            tracing::info!(
                "Processed {} files from manifest {}",
                issued,
                manifest.key
            );
            if manifest.entries.is_empty() {
                tracing::warn!("No valid entries found in {}", manifest.key);
            }

            if let Err(e) = self.ledger.record_manifest(&identity) {
                tracing::error!(
                    "Failed to record manifest {}: {}; it will be re-read",
                    manifest.key,
                    e
                );
                return Ok(requests);
            }
        }

        Ok(requests)
    }

    /// Runs claimed earlier but never executed, e.g. queued at shutdown
    pub fn pending(&self) -> Vec<RunRequest> {
        self.ledger.pending_runs()
    }

    /// Tick every interval until shutdown, forwarding requests to the
    /// executor
    pub async fn run(self, requests: mpsc::Sender<RunRequest>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "📡 Manifest sensor started (every {:?} on {}/{})",
            self.interval,
            self.storage.bucket(),
            self.prefix
        );

        let pending = self.pending();
        if !pending.is_empty() {
            tracing::info!("⏯️  Resuming {} pending runs", pending.len());
            for request in pending {
                if requests.send(request).await.is_err() {
                    tracing::warn!("Run executor is gone, stopping sensor");
                    return;
                }
            }
        }

        loop {
            match self.tick().await {
                Ok(batch) => {
                    for request in batch {
                        if requests.send(request).await.is_err() {
                            tracing::warn!("Run executor is gone, stopping sensor");
                            return;
                        }
                    }
                }
                Err(e) => tracing::error!("Sensor evaluation failed: {}", e),
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("🛑 Manifest sensor shutting down");
                    break;
                }
                _ = sleep(self.interval) => {}
            }
        }
    }
}
