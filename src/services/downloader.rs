//! Download resolution.
//!
//! Turns a `(server_name, media_id, thumbnail request)` into the record to
//! serve plus an open blob reader and the response metadata that goes with
//! it. Thumbnail requests resolve in this order:
//!
//! 1. An exact pre-generated match
//! 2. With dynamic thumbnails on, generate the exact size now
//! 3. Otherwise the configured fallback: nearest stored size, or not found
//!
//! Media the thumbnailer cannot decode and sources already smaller than the
//! request are served as the original.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{Config, ThumbnailFallback};
use crate::error::{AppError, Result};
use crate::models::{MediaId, MediaMetadata, ResizeMethod, ThumbnailSize};
use crate::services::database::MetadataStore;
use crate::services::storage::{BlobReader, BlobStorage};
use crate::services::thumbnailer::{GenerateOutcome, Thumbnailer};
use crate::services::uploader::Uploader;

/// Content types safe to render inline in a browser.
///
/// SVG is excluded because it can carry script.
const INLINE_SAFE_TYPES: &[&str] = &[
    "text/plain",
    "text/css",
    "text/csv",
    "application/json",
    "application/ld+json",
    "image/jpeg",
    "image/gif",
    "image/png",
    "image/apng",
    "image/webp",
    "image/avif",
    "video/mp4",
    "video/webm",
    "video/ogg",
    "video/quicktime",
    "audio/mp4",
    "audio/webm",
    "audio/aac",
    "audio/mpeg",
    "audio/ogg",
    "audio/wave",
    "audio/wav",
    "audio/x-wav",
    "audio/x-pn-wav",
    "audio/flac",
    "audio/x-flac",
];

/// Content-Security-Policy sent with every download
pub const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; script-src 'none'; \
     plugin-types application/pdf; style-src 'unsafe-inline'; object-src 'self';";

/// A requested thumbnail box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailRequest {
    pub width: u32,
    pub height: u32,
    pub method: Option<ResizeMethod>,
}

impl ThumbnailRequest {
    fn size(&self) -> ThumbnailSize {
        ThumbnailSize::new(self.width, self.height, self.method.unwrap_or_default())
    }
}

/// Everything needed to write a download response
#[derive(Debug)]
pub struct Download {
    /// The record being served (original or thumbnail)
    pub metadata: MediaMetadata,
    pub reader: BlobReader,
    pub content_type: String,
    pub content_length: u64,
    pub content_disposition: String,
    pub cache_control: String,
    /// Strong validator derived from the content hash
    pub etag: String,
}

/// Whether `content_type` may be displayed inline
pub fn is_inline_safe(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    INLINE_SAFE_TYPES.contains(&essence.as_str())
}

/// Build a `Content-Disposition` value with an RFC 5987 encoded filename
pub fn content_disposition(content_type: &str, filename: &str) -> String {
    let kind = if is_inline_safe(content_type) {
        "inline"
    } else {
        "attachment"
    };

    if filename.is_empty() {
        kind.to_string()
    } else {
        format!("{}; filename*=utf-8''{}", kind, urlencoding::encode(filename))
    }
}

/// Pick the stored thumbnail closest to `wanted`.
///
/// Prefers the smallest candidate covering the requested box, favouring the
/// requested method; otherwise the largest smaller candidate.
pub fn select_nearest<'a>(
    candidates: &'a [MediaMetadata],
    wanted: &ThumbnailSize,
) -> Option<&'a MediaMetadata> {
    let sized = candidates
        .iter()
        .filter_map(|m| m.thumbnail_size.map(|size| (m, size)));

    let covering = sized
        .clone()
        .filter(|(_, s)| s.width >= wanted.width && s.height >= wanted.height)
        .min_by_key(|(_, s)| (s.method != wanted.method, s.area()));

    covering
        .or_else(|| sized.max_by_key(|(_, s)| (s.method == wanted.method, s.area())))
        .map(|(m, _)| m)
}

/// Download resolver
pub struct Downloader {
    db: Arc<MetadataStore>,
    storage: Arc<dyn BlobStorage>,
    uploader: Arc<Uploader>,
    thumbnailer: Arc<Thumbnailer>,
    server_name: String,
    dynamic_thumbnails: bool,
    fallback: ThumbnailFallback,
    max_dimension: u32,
    cache_max_age: u64,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("server_name", &self.server_name)
            .field("dynamic_thumbnails", &self.dynamic_thumbnails)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl Downloader {
    pub fn new(
        config: &Config,
        db: Arc<MetadataStore>,
        storage: Arc<dyn BlobStorage>,
        uploader: Arc<Uploader>,
        thumbnailer: Arc<Thumbnailer>,
    ) -> Self {
        Self {
            db,
            storage,
            uploader,
            thumbnailer,
            server_name: config.server.server_name.clone(),
            dynamic_thumbnails: config.media.dynamic_thumbnails,
            fallback: config.media.thumbnail_fallback,
            max_dimension: config.media.max_thumbnail_dimension,
            cache_max_age: config.server.cache_max_age,
        }
    }

    fn validate_thumbnail(&self, request: &ThumbnailRequest) -> Result<()> {
        let in_range = |v: u32| v > 0 && v <= self.max_dimension;
        if !in_range(request.width) || !in_range(request.height) {
            return Err(AppError::validation(format!(
                "Thumbnail width and height must be between 1 and {}",
                self.max_dimension
            )));
        }
        Ok(())
    }

    /// Resolve and open a download.
    ///
    /// The media ID is validated before any storage or database access.
    pub async fn download(
        &self,
        server_name: &str,
        media_id: &str,
        thumbnail: Option<ThumbnailRequest>,
        custom_filename: Option<String>,
    ) -> Result<Download> {
        let media_id = MediaId::parse(media_id)?;
        if let Some(ref request) = thumbnail {
            self.validate_thumbnail(request)?;
        }

        if server_name != self.server_name {
            return Err(AppError::not_found(format!(
                "Remote media is not available: {}",
                server_name
            )));
        }

        let origin = self
            .db
            .get_media_metadata(&media_id)?
            .ok_or_else(|| AppError::not_found(format!("Media not found: {}", media_id)))?;

        let served = match thumbnail {
            Some(request) => self.resolve_thumbnail(origin, request.size()).await?,
            None => origin,
        };

        let bucket = self.storage.bucket(served.is_public);
        let path = self.uploader.blob_path(&served.base64_hash)?;
        let reader = self.storage.download_file(&bucket, &path).await?;

        let filename = custom_filename.unwrap_or_else(|| served.upload_name.clone());
        let cache_control = format!("public, max-age={}", self.cache_max_age);

        debug!(
            media_id = %served.media_id,
            thumbnail = served.is_thumbnail(),
            "Resolved download"
        );

        Ok(Download {
            content_type: served.content_type.clone(),
            content_length: served.file_size_bytes,
            content_disposition: content_disposition(&served.content_type, &filename),
            cache_control,
            etag: format!("\"{}\"", served.base64_hash),
            reader,
            metadata: served,
        })
    }

    async fn resolve_thumbnail(
        &self,
        origin: MediaMetadata,
        size: ThumbnailSize,
    ) -> Result<MediaMetadata> {
        if !origin.is_thumbnailable() || origin.is_thumbnail() {
            return Ok(origin);
        }

        if let Some(exact) = self.db.get_thumbnail(&origin.media_id, &size)? {
            return Ok(exact);
        }

        if self.dynamic_thumbnails {
            return match self.thumbnailer.generate(&origin, size).await {
                Ok(GenerateOutcome::Generated(m)) | Ok(GenerateOutcome::AlreadyExists(m)) => Ok(m),
                Ok(GenerateOutcome::SourceTooSmall) => Ok(origin),
                // Content that claims a decodable type but fails to decode
                Err(AppError::ImageProcessing(e)) => {
                    warn!(
                        media_id = %origin.media_id,
                        error = %e,
                        "Cannot thumbnail media, serving original"
                    );
                    Ok(origin)
                }
                Err(e) => Err(e),
            };
        }

        match self.fallback {
            ThumbnailFallback::NotFound => Err(AppError::not_found(format!(
                "No {} thumbnail for {}",
                size, origin.media_id
            ))),
            ThumbnailFallback::Nearest => {
                let stored = self.db.get_thumbnails(&origin.media_id)?;
                Ok(select_nearest(&stored, &size).cloned().unwrap_or(origin))
            }
        }
    }
}
