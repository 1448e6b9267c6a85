//! pkm server - a personal knowledge base with typed links and a graph view.
//!
//! The application is organized into the following modules:
//!
//! - `models`: Notes, tags, links, accounts, and graph view types
//! - `store`: sled-backed repository
//! - `notes`, `tags`, `links`: Service operations
//! - `graph`, `graph_query`: Graph algorithms and the visualizer's query API
//! - `auth`: Account, JWT access tokens, and refresh token rotation
//! - `handlers`: JSON route handlers

use pkm::{config::Config, router, AppState};
use std::sync::Arc;

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pkm=debug")),
        )
        .init();

    let config = Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    let bind = config.bind.clone();
    let state = Arc::new(AppState::open(config)?);
    tracing::info!(
        data_dir = %state.config.data_dir.display(),
        notes = state.store.note_count(),
        links = state.store.link_count(),
        "database opened"
    );
    if state.store.user_count() == 0 {
        tracing::info!("no account yet; POST /api/auth/register to create one");
    }

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("pkm server running at http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.store.flush()?;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
