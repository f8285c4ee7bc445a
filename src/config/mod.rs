use crate::error::{PipelineError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Bounded exponential backoff for uploads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3)
    pub max_attempts: u32,
    /// Delay before the first retry (default: 500 ms)
    pub base_delay: Duration,
    /// Upper bound for any single delay (default: 30 s)
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given zero-based failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Pipeline configuration, loaded from the environment
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// S3 endpoint (`AWS_S3_ENDPOINT_URL`)
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Region (default: "us-east-1")
    pub region: String,

    /// Bucket holding manifests and receiving uploads
    pub dest_bucket: String,
    /// Prefix searched for `*.tsv` manifests
    pub manifest_prefix: String,
    /// Scratch root; runs use `<scratch>/nemo_manifest/run-*`
    pub scratch_path: PathBuf,
    /// Sensor ledger file (default: `<scratch>/ledger.json`)
    pub ledger_path: PathBuf,

    pub upload_retry: RetryPolicy,

    /// Download attempts for interrupted transfers (default: 3)
    pub download_attempts: u32,
    /// Connect timeout (default: 120 s)
    pub download_connect_timeout: Duration,
    /// Read timeout between body chunks (default: 2 h)
    pub download_read_timeout: Duration,

    /// Sensor poll interval (default: 10 s)
    pub sensor_interval: Duration,

    /// Files at or above this size use multipart upload (default: 25 MB)
    pub multipart_threshold: u64,
    /// Multipart part size (default: 100 MB)
    pub multipart_chunk_size: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            region: "us-east-1".to_string(),
            dest_bucket: String::new(),
            manifest_prefix: String::new(),
            scratch_path: PathBuf::from("/tmp"),
            ledger_path: PathBuf::from("/tmp/ledger.json"),
            upload_retry: RetryPolicy::default(),
            download_attempts: 3,
            download_connect_timeout: Duration::from_secs(120),
            download_read_timeout: Duration::from_secs(2 * 3600),
            sensor_interval: Duration::from_secs(10),
            multipart_threshold: 25 * 1024 * 1024, // 25 MB
            multipart_chunk_size: 100 * 1024 * 1024, // 100 MB
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PipelineError::Config(format!("{} must be set", name)))
        };
        let parsed = |name: &str| -> Result<Option<u64>> {
            match lookup(name) {
                Some(v) => v.trim().parse::<u64>().map(Some).map_err(|_| {
                    PipelineError::Config(format!("{} must be an unsigned integer, got '{}'", name, v))
                }),
                None => Ok(None),
            }
        };
        let parsed_u32 = |name: &str| -> Result<Option<u32>> {
            parsed(name)?
                .map(|v| {
                    u32::try_from(v).map_err(|_| {
                        PipelineError::Config(format!("{} is out of range: {}", name, v))
                    })
                })
                .transpose()
        };

        let scratch_path = PathBuf::from(required("SCRATCH_PATH")?);

        let config = Self {
            endpoint_url: required("AWS_S3_ENDPOINT_URL")?,
            access_key_id: required("AWS_ACCESS_KEY_ID")?,
            secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
            region: lookup("AWS_REGION").unwrap_or(default.region),

            dest_bucket: required("DEST_BUCKET")?,
            manifest_prefix: required("MANIFEST_PREFIX")?,
            scratch_path: scratch_path.clone(),
            ledger_path: lookup("LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| scratch_path.join("ledger.json")),

            upload_retry: RetryPolicy {
                max_attempts: parsed_u32("UPLOAD_MAX_ATTEMPTS")?
                    .unwrap_or(default.upload_retry.max_attempts),
                base_delay: parsed("UPLOAD_BASE_DELAY_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(default.upload_retry.base_delay),
                max_delay: parsed("UPLOAD_MAX_DELAY_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(default.upload_retry.max_delay),
            },

            download_attempts: parsed_u32("DOWNLOAD_ATTEMPTS")?
                .unwrap_or(default.download_attempts),
            download_connect_timeout: parsed("DOWNLOAD_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(default.download_connect_timeout),
            download_read_timeout: parsed("DOWNLOAD_READ_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(default.download_read_timeout),

            sensor_interval: parsed("SENSOR_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(default.sensor_interval),

            multipart_threshold: parsed("MULTIPART_THRESHOLD_BYTES")?
                .unwrap_or(default.multipart_threshold),
            multipart_chunk_size: parsed("MULTIPART_CHUNK_BYTES")?
                .unwrap_or(default.multipart_chunk_size),
        };

        config.validate()?;
        Ok(config)
    }

    /// Parent directory of the per-run scratch directories
    pub fn run_scratch_root(&self) -> PathBuf {
        self.scratch_path.join("nemo_manifest")
    }

    fn validate(&self) -> Result<()> {
        if self.upload_retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "UPLOAD_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.download_attempts == 0 {
            return Err(PipelineError::Config(
                "DOWNLOAD_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        // S3 rejects parts under 5 MB except the last one
        if self.multipart_chunk_size < 5 * 1024 * 1024 {
            return Err(PipelineError::Config(
                "MULTIPART_CHUNK_BYTES must be at least 5 MB".to_string(),
            ));
        }
        Ok(())
    }
}
