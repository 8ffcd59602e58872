//! Background thumbnail worker.
//!
//! Consumes [`ThumbnailJob`] messages and pre-generates the configured sizes
//! for each new image. Failures are logged and the message is dropped; the
//! uploader never sees them.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::ThumbnailSize;
use crate::services::database::MetadataStore;
use crate::services::queue::{Message, Subscription, ThumbnailJob};
use crate::services::thumbnailer::{GenerateOutcome, Thumbnailer};

/// Queue consumer that generates thumbnails
#[derive(Clone)]
pub struct ThumbnailWorker {
    db: Arc<MetadataStore>,
    thumbnailer: Arc<Thumbnailer>,
    sizes: Arc<Vec<ThumbnailSize>>,
}

impl ThumbnailWorker {
    pub fn new(
        db: Arc<MetadataStore>,
        thumbnailer: Arc<Thumbnailer>,
        sizes: Vec<ThumbnailSize>,
    ) -> Self {
        Self {
            db,
            thumbnailer,
            sizes: Arc::new(sizes),
        }
    }

    /// Handle one message.
    ///
    /// Returns the number of thumbnails newly generated.
    pub async fn handle(&self, message: &Message) -> Result<usize> {
        let job = ThumbnailJob::from_message(message)?;

        let Some(metadata) = self.db.get_media_metadata(&job.media_id)? else {
            debug!(media_id = %job.media_id, "Media vanished before thumbnailing");
            return Ok(0);
        };

        if !metadata.is_thumbnailable() || metadata.is_thumbnail() || self.sizes.is_empty() {
            return Ok(0);
        }

        let outcomes = self.thumbnailer.generate_all(&metadata, &self.sizes).await?;
        Ok(outcomes
            .iter()
            .filter(|o| matches!(o, GenerateOutcome::Generated(_)))
            .count())
    }

    /// Consume `subscription` until it closes or `cancel` fires
    pub async fn run(self, subscription: Subscription, cancel: CancellationToken) {
        info!(topic = %subscription.topic(), "Thumbnail worker started");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match self.handle(&message).await {
                Ok(generated) if generated > 0 => {
                    debug!(generated = generated, "Thumbnail job complete");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Thumbnail job failed");
                }
            }
        }

        info!("Thumbnail worker stopped");
    }

    /// Spawn the worker onto the runtime
    pub fn spawn(self, subscription: Subscription, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(subscription, cancel))
    }
}
