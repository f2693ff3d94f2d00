use anyhow::{Context, Result};
use netra_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod annotate;
mod config;
mod confirmer;
mod engine;
mod http;
mod session;
mod stream;
#[cfg(test)]
mod testing;

use config::Config;
use engine::{OnnxBackend, VerificationController};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("netrad starting");

    let config = Config::from_env();
    if config.video_source.is_none() {
        tracing::warn!("NETRA_VIDEO_SOURCE is not set; sessions will fail to start");
    }

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteStore::open(&config.db_path).context("opening record store")?);

    let controller = Arc::new(VerificationController::new(
        config.clone(),
        Arc::new(OnnxBackend),
        store.clone(),
    ));

    let app = http::router(http::AppState {
        controller: Arc::clone(&controller),
        store,
        stream_timeout: controller.config().stream_timeout,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "netrad ready");

    let shutdown_controller = Arc::clone(&controller);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("netrad shutting down");
            // Closing the frame buffer ends open preview streams.
            let _ = tokio::task::spawn_blocking(move || shutdown_controller.shutdown()).await;
        })
        .await?;

    Ok(())
}
