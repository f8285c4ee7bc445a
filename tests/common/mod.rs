#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use omics_ingest::config::RetryPolicy;
use omics_ingest::error::{PipelineError, Result, StorageErrorKind};
use omics_ingest::services::fetch::HttpSource;
use omics_ingest::services::pipeline::{Pipeline, PipelineOptions};
use omics_ingest::services::storage::{ObjectStorage, ObjectSummary, StoredObject};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory bucket with scripted upload failures
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
    upload_failures: Mutex<HashMap<String, (u32, StorageErrorKind)>>,
    upload_calls: Mutex<Vec<String>>,
    version: Mutex<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, data: &[u8]) {
        let mut version = self.version.lock().unwrap();
        *version += 1;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data.to_vec(), format!("\"v{}\"", version)));
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|(d, _)| d.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Fail the next `times` uploads of `key` with `kind`
    pub fn fail_uploads(&self, key: &str, times: u32, kind: StorageErrorKind) {
        self.upload_failures
            .lock()
            .unwrap()
            .insert(key.to_string(), (times, kind));
    }

    pub fn upload_calls(&self, key: &str) -> usize {
        self.upload_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|k| *k == key)
            .count()
    }

    pub fn total_upload_calls(&self) -> usize {
        self.upload_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    fn bucket(&self) -> &str {
        "memory"
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (d, tag))| ObjectSummary {
                key: k.clone(),
                e_tag: Some(tag.clone()),
                size: d.len() as u64,
            })
            .collect())
    }

    async fn get_object(&self, key: &str) -> Result<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(data, tag)| StoredObject {
                data: data.clone(),
                e_tag: Some(tag.clone()),
            })
            .ok_or_else(|| PipelineError::storage(key, StorageErrorKind::Permanent, "NoSuchKey"))
    }

    async fn upload_file(&self, key: &str, path: &Path) -> Result<u64> {
        self.upload_calls.lock().unwrap().push(key.to_string());

        let scripted = {
            let mut failures = self.upload_failures.lock().unwrap();
            match failures.get_mut(key) {
                Some((remaining, kind)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*kind)
                }
                _ => None,
            }
        };
        if let Some(kind) = scripted {
            return Err(PipelineError::storage(key, kind, "InvalidPart"));
        }

        let data = std::fs::read(path)?;
        let len = data.len() as u64;
        self.put(key, &data);
        Ok(len)
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

struct ArchiveState {
    files: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, u32>>,
    hits: Mutex<HashMap<String, u32>>,
}

/// HTTP archive fixture; answers 503 for the scripted number of requests
pub struct FixtureArchive {
    pub base: String,
    state: Arc<ArchiveState>,
}

impl FixtureArchive {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Requests received for `path`, including failed ones
    pub fn hits(&self, path: &str) -> u32 {
        self.state.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

async fn serve_file(State(state): State<Arc<ArchiveState>>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    *state.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

    let fail = {
        let mut failures = state.failures.lock().unwrap();
        match failures.get_mut(&path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    };
    if fail {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match state.files.get(&path) {
        Some(data) => data.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serves `files` (path -> body) over HTTP on an ephemeral port.
/// Returns the base URL, e.g. `http://127.0.0.1:41234`.
pub async fn spawn_archive(files: Vec<(&str, Vec<u8>)>) -> String {
    spawn_flaky_archive(files, Vec::new()).await.base
}

/// Like [`spawn_archive`], but the first `n` requests for each listed
/// path get a 503
pub async fn spawn_flaky_archive(
    files: Vec<(&str, Vec<u8>)>,
    failures: Vec<(&str, u32)>,
) -> FixtureArchive {
    let state = Arc::new(ArchiveState {
        files: files
            .into_iter()
            .map(|(path, data)| (path.to_string(), data))
            .collect(),
        failures: Mutex::new(
            failures
                .into_iter()
                .map(|(path, n)| (path.to_string(), n))
                .collect(),
        ),
        hits: Mutex::new(HashMap::new()),
    });
    let app = Router::new().fallback(serve_file).with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    FixtureArchive {
        base: format!("http://{}", addr),
        state,
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

pub fn tarball(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Single tar member with its name bytes written verbatim
pub fn raw_tarball(name: &[u8], data: &[u8]) -> Vec<u8> {
    let mut header = tar::Header::new_gnu();
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, data).unwrap();
    builder.into_inner().unwrap()
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub fn build_pipeline(storage: Arc<MemoryStorage>, scratch_root: PathBuf) -> Pipeline {
    let _ = tracing_subscriber::fmt::try_init();
    let source = HttpSource::new(Duration::from_secs(5), Duration::from_secs(30)).unwrap();
    Pipeline::new(
        storage,
        Arc::new(source),
        PipelineOptions {
            scratch_root,
            upload_retry: fast_retry(3),
            download_attempts: 3,
        },
    )
}

/// Entries left in a directory (missing directory counts as empty)
pub fn dir_entries(path: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(path) {
        Ok(rd) => rd.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}
