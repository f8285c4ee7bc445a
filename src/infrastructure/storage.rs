use crate::config::PipelineConfig;
use crate::services::storage::S3Storage;
use aws_sdk_s3::config::Region;
use std::sync::Arc;
use tracing::info;

pub async fn setup_storage(config: &PipelineConfig) -> Arc<S3Storage> {
    info!(
        "☁️  S3 Storage: {} (Bucket: {})",
        config.endpoint_url, config.dest_bucket
    );

    let aws_config = aws_config::from_env()
        .endpoint_url(&config.endpoint_url)
        .region(Region::new(config.region.clone()))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);

    match s3_client.head_bucket().bucket(&config.dest_bucket).send().await {
        Ok(_) => info!("✅ Bucket '{}' is ready", config.dest_bucket),
        Err(e) => tracing::warn!(
            "⚠️  Bucket '{}' is not reachable yet: {}",
            config.dest_bucket,
            aws_sdk_s3::error::DisplayErrorContext(&e)
        ),
    }

    Arc::new(
        S3Storage::new(s3_client, config.dest_bucket.clone())
            .with_multipart(config.multipart_threshold, config.multipart_chunk_size),
    )
}
