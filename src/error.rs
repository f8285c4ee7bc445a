use thiserror::Error;

/// Whether a storage failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Timeouts, dropped connections, throttling, 5xx and `InvalidPart`
    Transient,
    /// Everything else (auth, missing bucket, bad request)
    Permanent,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The manifest cannot be used at all; the manifest run is aborted
    #[error("malformed manifest {key}: {reason}")]
    ManifestFormat { key: String, reason: String },

    #[error("checksum mismatch for {file_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file_id: String,
        expected: String,
        actual: String,
    },

    #[error("transfer of {url} failed: {message}")]
    Transfer {
        url: String,
        transient: bool,
        message: String,
    },

    #[error("storage operation on {key} failed: {message}")]
    Storage {
        key: String,
        kind: StorageErrorKind,
        message: String,
    },

    #[error("archive {file_id}: {reason}")]
    Archive { file_id: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn manifest(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ManifestFormat {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(key: impl Into<String>, kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self::Storage {
            key: key.into(),
            kind,
            message: message.into(),
        }
    }

    /// True for failures a retry could plausibly fix
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transfer { transient, .. } => *transient,
            Self::Storage { kind, .. } => *kind == StorageErrorKind::Transient,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = PipelineError::storage("a/b", StorageErrorKind::Transient, "slow down");
        assert!(err.is_transient());

        let err = PipelineError::storage("a/b", StorageErrorKind::Permanent, "access denied");
        assert!(!err.is_transient());

        let err = PipelineError::ChecksumMismatch {
            file_id: "x".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_manifest_error_message() {
        let err = PipelineError::manifest("manifests/a.tsv", "missing column 'md5'");
        assert_eq!(
            err.to_string(),
            "malformed manifest manifests/a.tsv: missing column 'md5'"
        );
    }
}
