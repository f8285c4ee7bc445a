use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One remote file listed in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_id: String,
    pub url: String,
    /// Expected hex digest (MD5 or SHA-256, picked by length)
    pub md5: String,
    pub size: Option<u64>,
    pub sample_id: String,
    /// Destination prefix derived from the URL path
    pub path_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Object key the manifest was read from
    pub key: String,
    /// ETag of the object version the entries were parsed from
    #[serde(default)]
    pub e_tag: Option<String>,
    pub entries: Vec<ManifestEntry>,
}

/// A manifest object as listed in the bucket.
/// Key plus ETag, so a re-uploaded manifest counts as new.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestIdentity {
    pub key: String,
    pub e_tag: Option<String>,
}

impl ManifestIdentity {
    pub fn as_key(&self) -> String {
        match &self.e_tag {
            Some(tag) => format!("{}@{}", self.key, tag.trim_matches('"')),
            None => self.key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    Verified,
    Mismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub file_id: String,
    pub source_url: String,
    pub local_path: PathBuf,
    pub bytes: u64,
    pub expected_checksum: String,
    pub computed_checksum: String,
    pub status: ValidationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub key: String,
    pub success: bool,
    /// Attempts made beyond the first
    pub retries: u32,
    pub bytes: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_key: String,
    pub manifest_key: String,
    pub entry: ManifestEntry,
    pub tags: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn run_key_for(file_id: &str) -> String {
        format!("nemo_manifest_{}", file_id)
    }

    pub fn from_entry(manifest_key: &str, entry: ManifestEntry) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("nemo_manifest".to_string(), manifest_key.to_string());
        tags.insert("file_id".to_string(), entry.file_id.clone());
        tags.insert(
            "size".to_string(),
            entry.size.map(|s| s.to_string()).unwrap_or_else(|| "-1".to_string()),
        );
        tags.insert("url".to_string(), entry.url.clone());
        tags.insert("sample_id".to_string(), entry.sample_id.clone());

        Self {
            run_key: Self::run_key_for(&entry.file_id),
            manifest_key: manifest_key.to_string(),
            entry,
            tags,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Uploaded { uploads: Vec<UploadResult> },
    ChecksumMismatch { expected: String, actual: String },
    DownloadFailed { error: String },
    ExtractFailed { error: String },
    /// At least one upload exhausted its attempts; successful siblings are kept
    UploadFailed { uploads: Vec<UploadResult> },
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Uploaded { .. })
    }

    pub fn uploads(&self) -> &[UploadResult] {
        match self {
            Self::Uploaded { uploads } | Self::UploadFailed { uploads } => uploads,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_key: String,
    pub file_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: FileOutcome,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub manifest_key: String,
    pub runs: Vec<RunReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.runs.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.runs.len() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}
