//! Application state management.
//!
//! This module defines the shared application state that is accessible
//! from all request handlers via Axum's State extractor.
//!
//! # Usage
//!
//! ```rust,ignore
//! async fn handler(State(state): State<AppState>) -> impl IntoResponse {
//!     let media = state.db.get_media_metadata(&id)?;
//!     // ...
//! }
//! ```

use crate::config::Config;
use crate::error::Result;
use crate::services::{
    storage, Downloader, LocalQueue, MessageQueue, MetadataStore, ThumbnailWorker, Thumbnailer,
    Uploader,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared application state
///
/// This struct holds all shared resources that handlers need access to.
/// It's wrapped in `Arc` and cloned into each request handler.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,

    /// Metadata store
    pub db: Arc<MetadataStore>,

    /// Blob storage backend
    pub storage: Arc<dyn storage::BlobStorage>,

    /// Thumbnail job queue
    pub queue: Arc<LocalQueue>,

    /// Upload orchestrator
    pub uploader: Arc<Uploader>,

    /// Thumbnail generator
    pub thumbnailer: Arc<Thumbnailer>,

    /// Download resolver
    pub downloader: Arc<Downloader>,
}

impl AppState {
    /// Create a new application state
    ///
    /// Opens the metadata store and sets up the configured blob backend.
    ///
    /// # Errors
    /// Returns error if services cannot be initialized
    pub async fn new(config: Config) -> Result<Self> {
        let db = Arc::new(MetadataStore::open(&config.storage.database_path())?);

        let storage = storage::connect(&config.storage)?;
        storage.setup().await?;

        let queue = Arc::new(LocalQueue::new());
        let uploader = Arc::new(Uploader::new(
            &config,
            db.clone(),
            storage.clone(),
            queue.clone() as Arc<dyn MessageQueue>,
        ));
        let thumbnailer = Arc::new(Thumbnailer::new(
            &config.media,
            db.clone(),
            storage.clone(),
            uploader.clone(),
        ));
        let downloader = Arc::new(Downloader::new(
            &config,
            db.clone(),
            storage.clone(),
            uploader.clone(),
            thumbnailer.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            db,
            storage,
            queue,
            uploader,
            thumbnailer,
            downloader,
        })
    }

    /// Spawn `[queue] workers` thumbnail consumers
    pub async fn spawn_thumbnail_workers(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let topic = &self.config.queue.thumbnail_topic;
        let worker = ThumbnailWorker::new(
            self.db.clone(),
            self.thumbnailer.clone(),
            self.config.media.thumbnail_sizes(),
        );

        let mut handles = Vec::with_capacity(self.config.queue.workers);
        for _ in 0..self.config.queue.workers {
            let subscription = self.queue.subscribe(topic).await?;
            handles.push(worker.clone().spawn(subscription, cancel.clone()));
        }

        info!(
            workers = handles.len(),
            topic = %topic,
            "Thumbnail workers started"
        );

        Ok(handles)
    }

    /// Get the configured server name
    pub fn server_name(&self) -> &str {
        &self.config.server.server_name
    }

    /// Get the maximum upload size (0 = unlimited)
    pub fn max_upload_size(&self) -> u64 {
        self.config.media.max_file_size_bytes
    }

    /// Resolve an access token to its owner ID
    pub fn owner_for_token(&self, token: &str) -> Option<&str> {
        self.config.auth.access_tokens.get(token).map(String::as_str)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("db", &self.db)
            .field("storage", &"<BlobStorage>")
            .field("uploader", &self.uploader)
            .field("downloader", &self.downloader)
            .finish()
    }
}
