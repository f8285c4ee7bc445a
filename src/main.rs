use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use omics_ingest::config::PipelineConfig;
use omics_ingest::infrastructure::storage;
use omics_ingest::services::fetch::HttpSource;
use omics_ingest::services::ledger::{FileLedger, RunLedger};
use omics_ingest::services::manifest::load_manifest;
use omics_ingest::services::pipeline::{Pipeline, PipelineOptions};
use omics_ingest::services::sensor::Sensor;
use omics_ingest::services::storage::ObjectStorage;
use omics_ingest::services::upload::upload_with_retry;
use omics_ingest::services::worker::RunExecutor;
use omics_ingest::utils::hash::{ChecksumAlgorithm, calculate_hash_from_reader};
use omics_ingest::utils::validation::{destination_key, human_readable_size};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the manifest prefix and process new entries until stopped
    Watch,
    /// Process every entry of one manifest object once
    Ingest {
        /// Object key of the manifest in DEST_BUCKET
        #[arg(short, long)]
        manifest: String,
    },
    /// Upload a single local file under a destination prefix
    Upload {
        #[arg(long)]
        src: PathBuf,
        #[arg(long)]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "omics_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PipelineConfig::from_env().context("failed to load configuration")?;
    info!(
        "🚀 Starting omics-ingest: bucket={}, prefix={}, scratch={}",
        config.dest_bucket,
        config.manifest_prefix,
        config.scratch_path.display()
    );

    let storage_service: Arc<dyn ObjectStorage> = storage::setup_storage(&config).await;

    match args.command {
        Command::Watch => watch(&config, storage_service).await,
        Command::Ingest { manifest } => ingest(&config, storage_service, &manifest).await,
        Command::Upload { src, prefix } => upload(&config, storage_service.as_ref(), &src, &prefix).await,
    }
}

fn build_pipeline(config: &PipelineConfig, storage: Arc<dyn ObjectStorage>) -> anyhow::Result<Pipeline> {
    let source = HttpSource::new(config.download_connect_timeout, config.download_read_timeout)?;
    Ok(Pipeline::new(
        storage,
        Arc::new(source),
        PipelineOptions::from(config),
    ))
}

async fn watch(config: &PipelineConfig, storage: Arc<dyn ObjectStorage>) -> anyhow::Result<()> {
    let pipeline = Arc::new(build_pipeline(config, storage.clone())?);
    let file_ledger = FileLedger::open(&config.ledger_path)?;
    info!("📒 Run ledger: {}", file_ledger.path().display());
    let ledger: Arc<dyn RunLedger> = Arc::new(file_ledger);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (request_tx, request_rx) = tokio::sync::mpsc::channel(64);

    let sensor = Sensor::new(
        storage,
        ledger.clone(),
        config.manifest_prefix.clone(),
        config.sensor_interval,
    );
    let sensor_handle = tokio::spawn(sensor.run(request_tx, shutdown_rx.clone()));

    let executor = RunExecutor::new(pipeline, request_rx, shutdown_rx).with_ledger(ledger);
    let executor_handle = tokio::spawn(executor.run());

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    info!("🛑 Waiting for the current run to finish...");
    if let Err(e) = sensor_handle.await {
        error!("❌ Sensor task failed: {}", e);
    }
    match executor_handle.await {
        Ok(stats) => info!("👋 Exited cleanly after {} runs ({} failed)", stats.runs, stats.failed),
        Err(e) => error!("❌ Run executor task failed: {}", e),
    }
    Ok(())
}

async fn ingest(
    config: &PipelineConfig,
    storage: Arc<dyn ObjectStorage>,
    manifest_key: &str,
) -> anyhow::Result<()> {
    let manifest = load_manifest(storage.as_ref(), manifest_key).await?;
    let pipeline = build_pipeline(config, storage)?;
    let report = pipeline.run_manifest(&manifest).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_success() {
        bail!(
            "{} of {} entries in {} failed",
            report.failed(),
            report.runs.len(),
            manifest_key
        );
    }
    Ok(())
}

async fn upload(
    config: &PipelineConfig,
    storage: &dyn ObjectStorage,
    src: &Path,
    prefix: &str,
) -> anyhow::Result<()> {
    let file_name = src
        .file_name()
        .with_context(|| format!("{} has no file name", src.display()))?;
    let key = destination_key(prefix, Path::new(file_name));
    let size = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("cannot read {}", src.display()))?
        .len();

    let file = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {}", src.display()))?;
    let md5 = calculate_hash_from_reader(ChecksumAlgorithm::Md5, file).await?;
    info!(
        "Uploading {} ({}, md5 {}) to {}",
        src.display(),
        human_readable_size(size),
        md5,
        key
    );
    if storage.object_exists(&key).await? {
        warn!("{} already exists in {} and will be replaced", key, storage.bucket());
    }
    let result = upload_with_retry(storage, src, &key, &config.upload_retry).await;
    if !result.success {
        bail!(
            "upload of {} failed after {} retries: {}",
            key,
            result.retries,
            result.error.unwrap_or_default()
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
