//! Thumbnail generation.
//!
//! Thumbnails are produced from a stored original:
//! - **Scale**: fit inside the requested box, preserving aspect ratio
//! - **Crop**: cover the box, then center-crop the excess so the output is exact
//!
//! Output is always JPEG, so transparency in the source is flattened.
//! A generated thumbnail goes through the regular upload path and is stored
//! as an ordinary blob plus a record with `parent_id` set.
//!
//! Generation never upscales: a request at least as large as the source in
//! both dimensions is a no-op.

use dashmap::DashMap;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use crate::config::MediaConfig;
use crate::error::{AppError, Result};
use crate::models::{MediaMetadata, ResizeMethod, ThumbnailSize};
use crate::services::database::MetadataStore;
use crate::services::storage::BlobStorage;
use crate::services::uploader::{UploadRequest, Uploader};

/// JPEG quality for generated thumbnails
pub const JPEG_QUALITY: u8 = 85;

/// Content type of generated thumbnails
pub const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// What a generation call did
#[derive(Debug, Clone)]
pub enum GenerateOutcome {
    /// A new thumbnail was stored
    Generated(MediaMetadata),
    /// A thumbnail of this size and method was already stored
    AlreadyExists(MediaMetadata),
    /// The source is not larger than the requested size
    SourceTooSmall,
}

impl GenerateOutcome {
    /// The thumbnail record, if one exists after the call
    pub fn metadata(&self) -> Option<&MediaMetadata> {
        match self {
            Self::Generated(m) | Self::AlreadyExists(m) => Some(m),
            Self::SourceTooSmall => None,
        }
    }
}

/// Dimensions of a scale thumbnail fitting inside `max_w` x `max_h`
pub fn scale_dimensions(src_w: u32, src_h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let ratio = f64::min(
        f64::from(max_w) / f64::from(src_w),
        f64::from(max_h) / f64::from(src_h),
    )
    .min(1.0);

    let w = (f64::from(src_w) * ratio).round().max(1.0) as u32;
    let h = (f64::from(src_h) * ratio).round().max(1.0) as u32;
    (w, h)
}

/// Intermediate size that fully covers `w` x `h` before cropping
pub fn cover_dimensions(src_w: u32, src_h: u32, w: u32, h: u32) -> (u32, u32) {
    let ratio = f64::max(
        f64::from(w) / f64::from(src_w),
        f64::from(h) / f64::from(src_h),
    );

    let cw = ((f64::from(src_w) * ratio).round() as u32).max(w);
    let ch = ((f64::from(src_h) * ratio).round() as u32).max(h);
    (cw, ch)
}

/// Resize a decoded image according to `size`
pub fn resize(img: &DynamicImage, size: &ThumbnailSize) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();

    match size.method {
        ResizeMethod::Scale => {
            let (w, h) = scale_dimensions(src_w, src_h, size.width, size.height);
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
        ResizeMethod::Crop => {
            let (cw, ch) = cover_dimensions(src_w, src_h, size.width, size.height);
            let covered = img.resize_exact(cw, ch, FilterType::Lanczos3);
            let x = (cw - size.width) / 2;
            let y = (ch - size.height) / 2;
            covered.crop_imm(x, y, size.width, size.height)
        }
    }
}

/// Encode as baseline JPEG
pub fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
    encoder
        .encode_image(&rgb)
        .map_err(|e| AppError::image_processing(format!("JPEG encoding failed: {}", e)))?;
    Ok(buffer)
}

/// Decode `data` and produce a thumbnail, or `None` if the source is small enough
fn render(data: &[u8], size: &ThumbnailSize) -> Result<Option<Vec<u8>>> {
    let (src_w, src_h) = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .into_dimensions()?;

    if size.width >= src_w && size.height >= src_h {
        return Ok(None);
    }

    let img = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .decode()
        .map_err(|e| AppError::image_processing(format!("Failed to decode image: {}", e)))?;

    let thumbnail = resize(&img, size);
    debug!(
        source = %format!("{}x{}", src_w, src_h),
        output = %format!("{}x{}", thumbnail.width(), thumbnail.height()),
        method = %size.method,
        "Resized image"
    );

    encode_jpeg(&thumbnail).map(Some)
}

/// A caller's share of one per-thumbnail lock.
///
/// The map entry is removed when the last holder drops its slot, including
/// callers whose future is dropped while still waiting for the lock.
struct GenerationSlot<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl<'a> GenerationSlot<'a> {
    fn acquire(locks: &'a DashMap<String, Arc<Mutex<()>>>, key: String) -> Self {
        let lock = locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self { locks, key, lock }
    }
}

impl Drop for GenerationSlot<'_> {
    fn drop(&mut self) {
        // Map entry plus our clone means nobody else holds the lock
        self.locks
            .remove_if(&self.key, |_, l| Arc::strong_count(l) <= 2);
    }
}

/// Thumbnail generator
pub struct Thumbnailer {
    db: Arc<MetadataStore>,
    storage: Arc<dyn BlobStorage>,
    uploader: Arc<Uploader>,
    /// One lock per parent/size/method being generated
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Bounds concurrent decode/encode work
    permits: Semaphore,
}

impl std::fmt::Debug for Thumbnailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thumbnailer")
            .field("in_progress", &self.locks.len())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl Thumbnailer {
    pub fn new(
        config: &MediaConfig,
        db: Arc<MetadataStore>,
        storage: Arc<dyn BlobStorage>,
        uploader: Arc<Uploader>,
    ) -> Self {
        Self {
            db,
            storage,
            uploader,
            locks: DashMap::new(),
            permits: Semaphore::new(config.max_thumbnail_generators.max(1)),
        }
    }

    /// Generate one thumbnail of `source`.
    ///
    /// Safe to call repeatedly and concurrently: at most one record is stored
    /// per `(parent, width, height, method)`.
    pub async fn generate(
        &self,
        source: &MediaMetadata,
        size: ThumbnailSize,
    ) -> Result<GenerateOutcome> {
        if source.is_thumbnail() {
            return Err(AppError::validation(format!(
                "Media {} is itself a thumbnail",
                source.media_id
            )));
        }
        if !source.is_thumbnailable() {
            return Err(AppError::validation(format!(
                "Media {} is not an image ({})",
                source.media_id, source.content_type
            )));
        }

        if let Some(existing) = self.db.get_thumbnail(&source.media_id, &size)? {
            return Ok(GenerateOutcome::AlreadyExists(existing));
        }

        let slot = GenerationSlot::acquire(&self.locks, format!("{}:{}", source.media_id, size));
        let _guard = slot.lock.lock().await;
        self.generate_locked(source, size).await
    }

    async fn generate_locked(
        &self,
        source: &MediaMetadata,
        size: ThumbnailSize,
    ) -> Result<GenerateOutcome> {
        // Another task may have finished while we waited
        if let Some(existing) = self.db.get_thumbnail(&source.media_id, &size)? {
            return Ok(GenerateOutcome::AlreadyExists(existing));
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::internal(format!("Thumbnail semaphore closed: {}", e)))?;

        let data = self.read_source(source).await?;
        let jpeg = match tokio::task::spawn_blocking(move || render(&data, &size)).await?? {
            Some(jpeg) => jpeg,
            None => {
                debug!(
                    media_id = %source.media_id,
                    size = %size,
                    "Source not larger than requested size, skipping"
                );
                return Ok(GenerateOutcome::SourceTooSmall);
            }
        };

        let request = UploadRequest {
            owner_id: source.owner_id.clone(),
            upload_name: source.upload_name.clone(),
            content_type: THUMBNAIL_CONTENT_TYPE.to_string(),
            is_public: source.is_public,
            media_id: None,
            thumbnail: Some((source.media_id.clone(), size)),
        };

        let outcome = self.uploader.upload(request, &jpeg[..]).await?;

        info!(
            media_id = %outcome.metadata.media_id,
            parent_id = %source.media_id,
            size = %size,
            bytes = outcome.metadata.file_size_bytes,
            "Generated thumbnail"
        );

        Ok(GenerateOutcome::Generated(outcome.metadata))
    }

    async fn read_source(&self, source: &MediaMetadata) -> Result<Vec<u8>> {
        let bucket = self.storage.bucket(source.is_public);
        let path = self.uploader.blob_path(&source.base64_hash)?;

        let mut reader = self.storage.download_file(&bucket, &path).await?;
        let mut data = Vec::with_capacity(source.file_size_bytes as usize);
        reader.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// Generate each size in order, stopping at the first failure
    pub async fn generate_all(
        &self,
        source: &MediaMetadata,
        sizes: &[ThumbnailSize],
    ) -> Result<Vec<GenerateOutcome>> {
        let mut outcomes = Vec::with_capacity(sizes.len());
        for size in sizes {
            outcomes.push(self.generate(source, *size).await?);
        }
        Ok(outcomes)
    }
}
