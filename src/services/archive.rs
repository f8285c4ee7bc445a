use crate::error::{PipelineError, Result};
use crate::utils::validation::sanitize_member_path;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// A local file waiting to be uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCandidate {
    pub local_path: PathBuf,
    /// Path appended to the destination prefix
    pub relative: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Tar,
    TarGz,
}

fn archive_kind(file_id: &str) -> Option<ArchiveKind> {
    if file_id.ends_with(".tar.gz") || file_id.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if file_id.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

pub fn is_archive(file_id: &str) -> bool {
    archive_kind(file_id).is_some()
}

/// Turns a verified download into upload candidates.
///
/// Tarballs are unpacked into `extract_dir` (and the tarball deleted);
/// anything else is uploaded as-is under its file id.
pub async fn prepare_candidates(
    file_id: &str,
    downloaded: &Path,
    extract_dir: &Path,
) -> Result<Vec<UploadCandidate>> {
    let Some(kind) = archive_kind(file_id) else {
        return Ok(vec![UploadCandidate {
            local_path: downloaded.to_path_buf(),
            relative: PathBuf::from(file_id),
        }]);
    };

    tracing::info!("📦 Extracting tar file {}", file_id);

    let file_id_owned = file_id.to_string();
    let archive_path = downloaded.to_path_buf();
    let target = extract_dir.to_path_buf();
    let members = tokio::task::spawn_blocking(move || {
        extract(&file_id_owned, &archive_path, &target, kind)
    })
    .await
    .map_err(|e| PipelineError::Archive {
        file_id: file_id.to_string(),
        reason: format!("extraction task failed: {}", e),
    })??;

    tracing::info!("Extracted {} files from {}", members.len(), file_id);
    for member in &members {
        tracing::info!("  - {}", member.relative.display());
    }

    tokio::fs::remove_file(downloaded).await?;
    Ok(members)
}

fn extract(
    file_id: &str,
    archive_path: &Path,
    target: &Path,
    kind: ArchiveKind,
) -> Result<Vec<UploadCandidate>> {
    let file = File::open(archive_path)?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::Tar => Box::new(file),
        ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
    };
    let archive_error = |reason: String| PipelineError::Archive {
        file_id: file_id.to_string(),
        reason,
    };

    std::fs::create_dir_all(target)?;
    let mut archive = tar::Archive::new(reader);
    let mut members: Vec<UploadCandidate> = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| archive_error(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| archive_error(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let raw = entry
            .path()
            .map_err(|e| archive_error(e.to_string()))?
            .into_owned();
        let relative = sanitize_member_path(&raw)
            .ok_or_else(|| archive_error(format!("unsafe member path {}", raw.display())))?;

        let local_path = target.join(&relative);
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&local_path)
            .map_err(|e| archive_error(format!("{}: {}", relative.display(), e)))?;

        // A repeated member overwrites the earlier one on disk
        if let Some(pos) = members.iter().position(|m| m.relative == relative) {
            tracing::warn!("Duplicate member {} in {}", relative.display(), file_id);
            members.remove(pos);
        }
        members.push(UploadCandidate {
            local_path,
            relative,
        });
    }

    Ok(members)
}
