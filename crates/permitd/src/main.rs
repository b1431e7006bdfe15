use anyhow::{Context, Result};
use permit_core::{CascadeDetector, FsModelStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod engine;
mod passcode;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("permitd starting");

    let config = config::Config::from_env();

    let cascade_path = config
        .resolve_cascade_path()
        .context("no Haar cascade found; set PERMIT_CASCADE_PATH to haarcascade_frontalface_default.xml")?;
    let detector = CascadeDetector::load(&cascade_path)
        .with_context(|| format!("failed to load cascade {}", cascade_path.display()))?;
    tracing::info!(
        path = %cascade_path.display(),
        stages = detector.stage_count(),
        "face detector loaded"
    );

    let store = FsModelStore::open(&config.database_dir)
        .with_context(|| format!("failed to open model directory {}", config.database_dir.display()))?;
    tracing::info!(dir = %config.database_dir.display(), "model store ready");

    let engine = engine::FaceEngine::new(Arc::new(detector), Arc::new(store), config.engine_settings());
    let app = api::router(api::AppState::new(engine), config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "permitd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("permitd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
