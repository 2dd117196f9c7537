use anyhow::{Context, Result};
use property_images_service::api::{start_api_server, AppState};
use property_images_service::auth::StaticTokenResolver;
use property_images_service::config::Config;
use property_images_service::metadata_store::MetadataStore;
use property_images_service::object_storage::{ObjectStorage, S3ObjectStorage};
use property_images_service::provider_client::BuildiumClient;
use property_images_service::rate_limit::FixedWindowRateLimiter;
use property_images_service::resolver::{IdentifierResolver, PgPropertyDirectory};
use property_images_service::validation::UploadValidator;
use property_images_service::PropertyImageService;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Property Images Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let metadata_store = MetadataStore::new(&config.database)
        .await
        .context("Failed to initialize metadata store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let pool = metadata_store.pool().clone();

    let storage: Option<Arc<dyn ObjectStorage>> = match &config.s3 {
        Some(s3) => Some(Arc::new(
            S3ObjectStorage::new(s3)
                .await
                .context("Failed to initialize object storage")?,
        )),
        None => {
            warn!("No object storage configured; local image fallback is disabled");
            None
        }
    };

    let provider = BuildiumClient::new(&config.provider)
        .context("Failed to initialize provider client")?;

    let images = PropertyImageService::new(
        IdentifierResolver::new(Arc::new(PgPropertyDirectory::new(pool.clone()))),
        Arc::new(provider),
        Arc::new(metadata_store),
        storage,
    );

    let api_state = AppState {
        images: Arc::new(images),
        rate_limiter: Arc::new(FixedWindowRateLimiter::new(&config.rate_limit)),
        sessions: Arc::new(StaticTokenResolver::new(&config.auth)),
        validator: UploadValidator::new(config.upload.clone()),
        cache_max_age_secs: config.api.cache_max_age_secs,
        pool: Some(pool),
    };

    start_api_server(api_state, &config.api, shutdown_signal()).await?;

    info!("Property images service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
