use crate::error::{PipelineError, Result};
use crate::models::{ManifestIdentity, RunRequest};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Remembers which manifests were read and which run keys were issued,
/// so the sensor never enqueues the same work twice.
///
/// A claimed run stays pending until [`RunLedger::complete_run`], so work
/// queued but not executed before a shutdown can be resumed.
pub trait RunLedger: Send + Sync {
    fn manifest_seen(&self, identity: &ManifestIdentity) -> bool;
    fn record_manifest(&self, identity: &ManifestIdentity) -> Result<()>;
    /// Returns `true` if the run key was not issued before and is now claimed
    fn claim_run(&self, request: &RunRequest) -> Result<bool>;
    /// Marks a claimed run as executed, whatever its outcome
    fn complete_run(&self, run_key: &str) -> Result<()>;
    /// Claimed runs not yet completed, oldest first
    fn pending_runs(&self) -> Vec<RunRequest>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingRun {
    claimed_at: DateTime<Utc>,
    request: RunRequest,
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    manifests: DashMap<String, DateTime<Utc>>,
    runs: DashMap<String, DateTime<Utc>>,
    pending: DashMap<String, PendingRun>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            manifests: self
                .manifests
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            runs: self
                .runs
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            pending: self
                .pending
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    fn forget_manifest(&self, identity: &ManifestIdentity) {
        self.manifests.remove(&identity.as_key());
    }

    /// Undo a claim that could not be made durable
    fn release_run(&self, run_key: &str) {
        self.runs.remove(run_key);
        self.pending.remove(run_key);
    }
}

impl RunLedger for MemoryLedger {
    fn manifest_seen(&self, identity: &ManifestIdentity) -> bool {
        self.manifests.contains_key(&identity.as_key())
    }

    fn record_manifest(&self, identity: &ManifestIdentity) -> Result<()> {
        self.manifests.insert(identity.as_key(), Utc::now());
        Ok(())
    }

    fn claim_run(&self, request: &RunRequest) -> Result<bool> {
        match self.runs.entry(request.run_key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let claimed_at = Utc::now();
                slot.insert(claimed_at);
                self.pending.insert(
                    request.run_key.clone(),
                    PendingRun {
                        claimed_at,
                        request: request.clone(),
                    },
                );
                Ok(true)
            }
        }
    }

    fn complete_run(&self, run_key: &str) -> Result<()> {
        self.pending.remove(run_key);
        Ok(())
    }

    fn pending_runs(&self) -> Vec<RunRequest> {
        let mut pending: Vec<PendingRun> = self.pending.iter().map(|e| e.value().clone()).collect();
        pending.sort_by(|a, b| {
            a.claimed_at
                .cmp(&b.claimed_at)
                .then_with(|| a.request.run_key.cmp(&b.request.run_key))
        });
        pending.into_iter().map(|p| p.request).collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerSnapshot {
    manifests: BTreeMap<String, DateTime<Utc>>,
    runs: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pending: BTreeMap<String, PendingRun>,
}

/// Ledger persisted as JSON so restarts do not re-trigger old manifests
pub struct FileLedger {
    path: PathBuf,
    inner: MemoryLedger,
    write_lock: Mutex<()>,
}

impl FileLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = MemoryLedger::new();

        match std::fs::read(&path) {
            Ok(data) => {
                let snapshot: LedgerSnapshot = serde_json::from_slice(&data).map_err(|e| {
                    PipelineError::Config(format!("corrupt ledger {}: {}", path.display(), e))
                })?;
                for (key, at) in snapshot.manifests {
                    inner.manifests.insert(key, at);
                }
                for (key, at) in snapshot.runs {
                    inner.runs.insert(key, at);
                }
                for (key, run) in snapshot.pending {
                    inner.pending.insert(key, run);
                }
                tracing::info!(
                    "📒 Loaded run ledger {} ({} manifests, {} runs, {} pending)",
                    path.display(),
                    inner.manifests.len(),
                    inner.runs.len(),
                    inner.pending.len()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("📒 Starting new run ledger at {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| PipelineError::Config("ledger lock poisoned".to_string()))?;
        let json = serde_json::to_vec_pretty(&self.inner.snapshot())
            .map_err(|e| PipelineError::Config(format!("failed to encode ledger: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Atomic replace
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RunLedger for FileLedger {
    fn manifest_seen(&self, identity: &ManifestIdentity) -> bool {
        self.inner.manifest_seen(identity)
    }

    fn record_manifest(&self, identity: &ManifestIdentity) -> Result<()> {
        self.inner.record_manifest(identity)?;
        self.persist().inspect_err(|_| self.inner.forget_manifest(identity))
    }

    fn claim_run(&self, request: &RunRequest) -> Result<bool> {
        let claimed = self.inner.claim_run(request)?;
        if claimed {
            self.persist()
                .inspect_err(|_| self.inner.release_run(&request.run_key))?;
        }
        Ok(claimed)
    }

    fn complete_run(&self, run_key: &str) -> Result<()> {
        self.inner.complete_run(run_key)?;
        self.persist()
    }

    fn pending_runs(&self) -> Vec<RunRequest> {
        self.inner.pending_runs()
    }
}
