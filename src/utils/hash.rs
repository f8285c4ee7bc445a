use hex;
use sha2::{Digest, Sha256};

/// Digest algorithm, inferred from the expected hex digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn detect(expected: &str) -> Option<Self> {
        let expected = expected.trim();
        if !expected.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match expected.len() {
            32 => Some(Self::Md5),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// Incremental hasher fed while a download is being written
pub enum Checksummer {
    Md5(md5::Context),
    Sha256(Sha256),
}

impl Checksummer {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Self::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Sha256(hasher) => hasher.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(ctx) => format!("{:x}", ctx.compute()),
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Case-insensitive comparison of hex digests
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

pub fn calculate_hash(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
    let mut hasher = Checksummer::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

pub async fn calculate_hash_from_reader<R: tokio::io::AsyncRead + Unpin>(
    algorithm: ChecksumAlgorithm,
    mut reader: R,
) -> std::io::Result<String> {
    let mut hasher = Checksummer::new(algorithm);
    let mut buffer = [0u8; 8192];
    loop {
        let n = tokio::io::AsyncReadExt::read(&mut reader, &mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize_hex())
}
