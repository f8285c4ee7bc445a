mod common;

use common::{
    MemoryStorage, build_pipeline, dir_entries, md5_hex, raw_tarball, spawn_archive,
    spawn_flaky_archive, tarball,
};
use omics_ingest::error::StorageErrorKind;
use omics_ingest::models::{FileOutcome, Manifest, ManifestEntry, RunRequest};
use omics_ingest::services::manifest::parse_manifest;
use omics_ingest::utils::validation::parse_url_path_prefix;
use std::sync::Arc;

fn entry(base: &str, path: &str, file_id: &str, md5: String) -> ManifestEntry {
    let url = format!("{}{}/{}", base, path, file_id);
    ManifestEntry {
        file_id: file_id.to_string(),
        path_prefix: parse_url_path_prefix(&url),
        url,
        md5,
        size: None,
        sample_id: "P65M_1".to_string(),
    }
}

#[tokio::test]
async fn test_manifest_entries_all_uploaded_without_retries() {
    let names = [
        "P65M_0_RNA.bam",
        "P65M_1_RNA.bam",
        "P65M_2_RNA.bam",
        "P65M_3_RNA.bam",
    ];
    let files: Vec<(&str, Vec<u8>)> = names
        .iter()
        .map(|name| (*name, format!("reads for {}", name).into_bytes()))
        .collect();
    let paths: Vec<String> = names.iter().map(|n| format!("/biccn/align/{}", n)).collect();
    let base = spawn_archive(
        paths
            .iter()
            .zip(&files)
            .map(|(path, (_, data))| (path.as_str(), data.clone()))
            .collect(),
    )
    .await;

    let mut tsv = String::from("file_id\tmd5\tsize\tsample_id\turls\n");
    for (name, data) in &files {
        tsv.push_str(&format!(
            "{}\t{}\t{}\tP65M\t{}/biccn/align/{}\n",
            name,
            md5_hex(data),
            data.len(),
            base,
            name
        ));
    }
    let manifest = parse_manifest("manifests/align.tsv", &tsv).unwrap();

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = build_pipeline(storage.clone(), scratch.path().join("nemo_manifest"));

    let report = pipeline.run_manifest(&manifest).await;

    assert!(report.is_success());
    assert_eq!(report.succeeded(), 4);
    for run in &report.runs {
        let uploads = run.outcome.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].retries, 0);
    }
    for (name, data) in &files {
        let key = format!("biccn/align/{}", name);
        assert_eq!(storage.get(&key).as_deref(), Some(data.as_slice()));
    }
    assert_eq!(storage.total_upload_calls(), 4);
    assert!(dir_entries(&scratch.path().join("nemo_manifest")).is_empty());
}

#[tokio::test]
async fn test_checksum_mismatch_never_uploads() {
    let base = spawn_archive(vec![
        ("/raw/good.bam", b"good bytes".to_vec()),
        ("/raw/bad.bam", b"corrupted in transit".to_vec()),
    ])
    .await;

    let manifest = Manifest {
        key: "manifests/raw.tsv".to_string(),
        e_tag: None,
        entries: vec![
            entry(&base, "/raw", "bad.bam", md5_hex(b"what the archive promised")),
            entry(&base, "/raw", "good.bam", md5_hex(b"good bytes")),
        ],
    };

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = build_pipeline(storage.clone(), scratch.path().to_path_buf());

    let report = pipeline.run_manifest(&manifest).await;

    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    match &report.runs[0].outcome {
        FileOutcome::ChecksumMismatch { expected, actual } => {
            assert_eq!(expected, &md5_hex(b"what the archive promised"));
            assert_eq!(actual, &md5_hex(b"corrupted in transit"));
        }
        other => panic!("expected checksum mismatch, got {:?}", other),
    }
    assert_eq!(storage.upload_calls("raw/bad.bam"), 0);
    assert_eq!(storage.get("raw/good.bam").as_deref(), Some(&b"good bytes"[..]));
    assert!(dir_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_upload_retries_are_capped() {
    let base = spawn_archive(vec![
        ("/raw/flaky.bam", b"flaky".to_vec()),
        ("/raw/steady.bam", b"steady".to_vec()),
    ])
    .await;
    let manifest = Manifest {
        key: "manifests/raw.tsv".to_string(),
        e_tag: None,
        entries: vec![
            entry(&base, "/raw", "flaky.bam", md5_hex(b"flaky")),
            entry(&base, "/raw", "steady.bam", md5_hex(b"steady")),
        ],
    };

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    storage.fail_uploads("raw/flaky.bam", 10, StorageErrorKind::Transient);
    let pipeline = build_pipeline(storage.clone(), scratch.path().to_path_buf());

    let report = pipeline.run_manifest(&manifest).await;

    match &report.runs[0].outcome {
        FileOutcome::UploadFailed { uploads } => {
            assert_eq!(uploads.len(), 1);
            assert!(!uploads[0].success);
            assert_eq!(uploads[0].retries, 2);
        }
        other => panic!("expected upload failure, got {:?}", other),
    }
    assert_eq!(storage.upload_calls("raw/flaky.bam"), 3);
    assert!(report.runs[1].is_success());
    assert!(storage.get("raw/steady.bam").is_some());
    assert!(dir_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_transient_upload_failure_recovers() {
    let base = spawn_archive(vec![("/raw/a.bam", b"alpha".to_vec())]).await;
    let request = RunRequest::from_entry(
        "manifests/raw.tsv",
        entry(&base, "/raw", "a.bam", md5_hex(b"alpha")),
    );

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    storage.fail_uploads("raw/a.bam", 1, StorageErrorKind::Transient);
    let pipeline = build_pipeline(storage.clone(), scratch.path().to_path_buf());

    let report = pipeline.run(&request).await;

    assert!(report.is_success());
    assert_eq!(report.outcome.uploads()[0].retries, 1);
    assert_eq!(storage.get("raw/a.bam").as_deref(), Some(&b"alpha"[..]));
}

#[tokio::test]
async fn test_tar_members_uploaded_under_prefix() {
    let archive = tarball(&[
        ("SQ_BTR3002_S6_L001_R1_001.fastq.gz", b"read one"),
        ("SQ_BTR3002_S6_L001_R2_001.fastq.gz", b"read two"),
    ]);
    let base = spawn_archive(vec![("/biccn/raw/SQ_BTR3002_S6_L001.fastq.tar", archive.clone())]).await;
    let request = RunRequest::from_entry(
        "manifests/raw.tsv",
        entry(&base, "/biccn/raw", "SQ_BTR3002_S6_L001.fastq.tar", md5_hex(&archive)),
    );

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = build_pipeline(storage.clone(), scratch.path().to_path_buf());

    let report = pipeline.run(&request).await;

    assert!(report.is_success());
    assert_eq!(
        storage.keys(),
        vec![
            "biccn/raw/SQ_BTR3002_S6_L001_R1_001.fastq.gz".to_string(),
            "biccn/raw/SQ_BTR3002_S6_L001_R2_001.fastq.gz".to_string(),
        ]
    );
    assert_eq!(
        storage.get("biccn/raw/SQ_BTR3002_S6_L001_R2_001.fastq.gz").as_deref(),
        Some(&b"read two"[..])
    );
    assert!(dir_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_missing_remote_file_fails_and_cleans_scratch() {
    let base = spawn_archive(vec![]).await;
    let request = RunRequest::from_entry(
        "manifests/raw.tsv",
        entry(&base, "/raw", "gone.bam", md5_hex(b"x")),
    );

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = build_pipeline(storage.clone(), scratch.path().to_path_buf());

    let report = pipeline.run(&request).await;

    assert!(matches!(report.outcome, FileOutcome::DownloadFailed { .. }));
    assert_eq!(storage.total_upload_calls(), 0);
    assert!(dir_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_escaping_tar_member_fails_extraction() {
    let archive = raw_tarball(b"../../outside.txt", b"payload");
    let base = spawn_archive(vec![("/raw/evil.tar", archive.clone())]).await;
    let request = RunRequest::from_entry(
        "manifests/raw.tsv",
        entry(&base, "/raw", "evil.tar", md5_hex(&archive)),
    );

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = build_pipeline(storage.clone(), scratch.path().join("nemo_manifest"));

    let report = pipeline.run(&request).await;

    match &report.outcome {
        FileOutcome::ExtractFailed { error } => assert!(error.contains("unsafe member path")),
        other => panic!("expected extraction failure, got {:?}", other),
    }
    assert_eq!(storage.total_upload_calls(), 0);
    assert!(!scratch.path().join("outside.txt").exists());
    assert!(dir_entries(&scratch.path().join("nemo_manifest")).is_empty());
}

#[tokio::test]
async fn test_empty_tar_fails_extraction() {
    let archive = tarball(&[]);
    let base = spawn_archive(vec![("/raw/empty.tar", archive.clone())]).await;
    let request = RunRequest::from_entry(
        "manifests/raw.tsv",
        entry(&base, "/raw", "empty.tar", md5_hex(&archive)),
    );

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = build_pipeline(storage.clone(), scratch.path().to_path_buf());

    let report = pipeline.run(&request).await;

    assert!(matches!(report.outcome, FileOutcome::ExtractFailed { .. }));
    assert_eq!(storage.total_upload_calls(), 0);
    assert!(dir_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_duplicate_tar_member_uploaded_once() {
    let archive = tarball(&[
        ("r1.fastq.gz", b"stale copy"),
        ("r2.fastq.gz", b"read two"),
        ("r1.fastq.gz", b"final copy"),
    ]);
    let base = spawn_archive(vec![("/raw/run.fastq.tar", archive.clone())]).await;
    let request = RunRequest::from_entry(
        "manifests/raw.tsv",
        entry(&base, "/raw", "run.fastq.tar", md5_hex(&archive)),
    );

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = build_pipeline(storage.clone(), scratch.path().to_path_buf());

    let report = pipeline.run(&request).await;

    match &report.outcome {
        FileOutcome::Uploaded { uploads } => {
            let keys: Vec<_> = uploads.iter().map(|u| u.key.as_str()).collect();
            assert_eq!(keys, vec!["raw/r2.fastq.gz", "raw/r1.fastq.gz"]);
        }
        other => panic!("expected uploads, got {:?}", other),
    }
    assert_eq!(storage.upload_calls("raw/r1.fastq.gz"), 1);
    assert_eq!(storage.get("raw/r1.fastq.gz").as_deref(), Some(&b"final copy"[..]));
    assert!(dir_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_unavailable_archive_is_retried() {
    let archive = spawn_flaky_archive(vec![("/raw/a.bam", b"alpha".to_vec())], vec![("/raw/a.bam", 1)]).await;
    let request = RunRequest::from_entry(
        "manifests/raw.tsv",
        entry(&archive.base, "/raw", "a.bam", md5_hex(b"alpha")),
    );

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = build_pipeline(storage.clone(), scratch.path().to_path_buf());

    let report = pipeline.run(&request).await;

    assert!(report.is_success(), "{:?}", report.outcome);
    assert_eq!(archive.hits("/raw/a.bam"), 2);
    assert_eq!(storage.get("raw/a.bam").as_deref(), Some(&b"alpha"[..]));
    assert!(dir_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_download_attempts_are_capped() {
    let archive = spawn_flaky_archive(vec![("/raw/a.bam", b"alpha".to_vec())], vec![("/raw/a.bam", 10)]).await;
    let request = RunRequest::from_entry(
        "manifests/raw.tsv",
        entry(&archive.base, "/raw", "a.bam", md5_hex(b"alpha")),
    );

    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = build_pipeline(storage.clone(), scratch.path().to_path_buf());

    let report = pipeline.run(&request).await;

    assert!(matches!(report.outcome, FileOutcome::DownloadFailed { .. }));
    assert_eq!(archive.hits("/raw/a.bam"), 3);
    assert_eq!(storage.total_upload_calls(), 0);
    assert!(dir_entries(scratch.path()).is_empty());
}
