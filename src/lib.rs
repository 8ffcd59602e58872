//! # Matrix Media Store
//!
//! A content-addressed media repository speaking the Matrix media API.
//!
//! ## Features
//!
//! - **Content addressing**: blobs are stored under the SHA-256 of their bytes
//! - **Deduplication**: re-uploads by the same user return the existing media
//! - **Pluggable storage**: local filesystem, S3 or Google Cloud Storage
//! - **Thumbnails**: pre-generated in the background, or on demand
//! - **Search**: paginated search over a user's uploads
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  HTTP Server                     │
//! │  ┌─────────────┐ ┌─────────────┐ ┌───────────┐ │
//! │  │ Upload API  │ │Download API │ │Search API │ │
//! │  └─────────────┘ └─────────────┘ └───────────┘ │
//! ├─────────────────────────────────────────────────┤
//! │                   Services                       │
//! │  ┌──────────┐ ┌────────────┐ ┌───────────────┐ │
//! │  │ Uploader │ │ Downloader │ │  Thumbnailer  │ │
//! │  └──────────┘ └────────────┘ └───────────────┘ │
//! │        │    queue ──► ThumbnailWorker           │
//! ├─────────────────────────────────────────────────┤
//! │   Blob storage (local/S3/GCS)  │    RocksDB      │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the server
//! cargo run --release
//!
//! # Upload a file
//! curl -X POST "http://localhost:8008/_matrix/media/v3/upload?filename=cat.png" \
//!   -H "Authorization: Bearer <token>" --data-binary @cat.png
//!
//! # Download it
//! curl http://localhost:8008/_matrix/media/v3/download/{server}/{media_id}
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{AppError, Result};
pub use middleware::AuthenticatedUser;
pub use state::AppState;

use axum::{extract::DefaultBodyLimit, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

/// Run the media server with the given configuration.
///
/// Serves until Ctrl-C, then stops the thumbnail workers.
pub async fn run(config: Config) -> anyhow::Result<()> {
    // Create application state
    let state = AppState::new(config.clone()).await?;

    // Start background thumbnail workers
    let cancel = CancellationToken::new();
    let workers = state.spawn_thumbnail_workers(cancel.clone()).await?;

    let app = create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    info!(
        address = %addr,
        server_name = %config.server.server_name,
        "Media API server starting"
    );

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    state.queue.close();
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Thumbnail worker did not shut down cleanly");
        }
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    if state.config.auth.access_tokens.is_empty() {
        tracing::warn!("No access tokens configured, uploads will be rejected");
    }

    Router::new()
        .nest("/_matrix/media/v3", handlers::media_routes())
        .nest("/health", handlers::health_routes())
        // Upload size is enforced while streaming
        .layer(DefaultBodyLimit::disable())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
