mod api;
mod artifact_store;
mod config;
mod expiry;
mod job_service;
mod models;
mod process_runner;

use std::sync::Arc;

use anyhow::{Context, Result};
use artifact_store::ArtifactStore;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use config::Config;
use expiry::ExpiryScheduler;
use job_service::{JobService, JobSettings};
use process_runner::ProcessRunner;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Room for multipart boundaries and part headers on top of the upload ceiling.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<ArtifactStore>,
    pub scheduler: ExpiryScheduler,
    pub jobs: JobService,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "extract_relay_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("Failed to create work dir at {}", config.work_dir.display()))?;

    let store = Arc::new(ArtifactStore::open(&config.storage_root, config.max_upload_bytes).await?);
    let scheduler = ExpiryScheduler::new(Arc::clone(&store));
    let runner = ProcessRunner::new(
        config.worker_program.clone(),
        config.worker_leading_args.clone(),
        config.work_dir.clone(),
    );
    let jobs = JobService::new(
        runner,
        Arc::clone(&store),
        scheduler.clone(),
        JobSettings::from_config(&config),
    );

    let state = AppState {
        config: config.clone(),
        store,
        scheduler: scheduler.clone(),
        jobs,
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        worker = %config.worker_program,
        storage_root = %config.storage_root.display(),
        retention_seconds = config.retention.as_secs(),
        "extract-relay-api listening on {}",
        config.bind_addr
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.config.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/v1/parse", post(api::parse))
        .route(
            "/v1/artifacts",
            post(api::upload_artifact).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/v1/artifacts/{artifact_id}",
            get(api::download_artifact).delete(api::delete_artifact),
        )
        .route(
            "/v1/artifacts/{artifact_id}/metadata",
            get(api::artifact_metadata),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
