//! Deduplicating upload orchestrator.
//!
//! An upload is streamed into a temp directory while being hashed, checked
//! against the uploader's existing media by content hash, promoted into the
//! blob store at its hash path, and only then recorded in the metadata
//! store. The temp directory belongs to a [`TempUpload`] and is removed when
//! it goes out of scope, on success and on every error path.
//!
//! # Dedup policy
//!
//! A second upload of identical bytes by the same owner returns the existing
//! metadata record unchanged. Different owners uploading the same bytes get
//! separate records that share one blob.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{content_uri, MediaId, MediaMetadata, ThumbnailSize};
use crate::services::database::MetadataStore;
use crate::services::hasher::{write_temp_file, TempUpload};
use crate::services::queue::{MessageQueue, ThumbnailJob};
use crate::services::storage::{path_from_hash, BlobStorage};

/// Filenames starting with this are reserved
const RESERVED_NAME_PREFIX: char = '~';

/// Bytes inspected when sniffing the content type
const SNIFF_LEN: usize = 8192;

/// Fallback content type
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Parameters of one upload
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Matrix user ID of the uploader
    pub owner_id: String,
    /// Client-supplied filename; may be empty
    pub upload_name: String,
    /// Client-supplied content type; may be empty
    pub content_type: String,
    /// Store in the public bucket
    pub is_public: bool,
    /// Client-chosen media ID
    pub media_id: Option<MediaId>,
    /// Set when storing a generated thumbnail of an existing original
    pub thumbnail: Option<(MediaId, ThumbnailSize)>,
}

/// Result of a completed upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub metadata: MediaMetadata,
    /// `mxc://{server_name}/{media_id}`
    pub content_uri: String,
    /// True when an existing record was returned instead of a new one
    pub deduplicated: bool,
}

impl UploadOutcome {
    fn new(metadata: MediaMetadata, deduplicated: bool) -> Self {
        Self {
            content_uri: metadata.content_uri(),
            metadata,
            deduplicated,
        }
    }
}

/// Validate a client-supplied filename
pub fn validate_upload_name(name: &str) -> Result<()> {
    if name.starts_with(RESERVED_NAME_PREFIX) {
        return Err(AppError::validation(format!(
            "File name may not begin with {:?}",
            RESERVED_NAME_PREFIX
        )));
    }
    if name.contains(['/', '\\']) {
        return Err(AppError::validation(
            "File name may not contain path separators",
        ));
    }
    if name.contains('\0') {
        return Err(AppError::validation("File name may not contain NUL"));
    }
    Ok(())
}

/// Validate a Matrix user ID of the form `@localpart:server`
pub fn validate_owner_id(owner_id: &str) -> Result<()> {
    let valid = owner_id
        .strip_prefix('@')
        .and_then(|rest| rest.split_once(':'))
        .is_some_and(|(local, server)| {
            !local.is_empty() && !server.is_empty() && !owner_id.contains('\0')
        });

    if valid {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "Invalid user ID {:?}",
            owner_id
        )))
    }
}

/// A reserved client-chosen media ID, released on drop
struct MediaIdClaim<'a> {
    claims: &'a DashMap<MediaId, ()>,
    media_id: MediaId,
}

impl Drop for MediaIdClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.media_id);
    }
}

/// Promote `source` to `path` in `bucket`, then run `record`.
///
/// Returns whether the blob already existed. If `record` fails, a blob
/// written by this call is removed again; a pre-existing blob is shared with
/// other records and left alone.
async fn promote_then_record<F>(
    storage: &dyn BlobStorage,
    bucket: &str,
    source: &Path,
    path: &Path,
    record: F,
) -> Result<bool>
where
    F: FnOnce() -> Result<()>,
{
    let already_existed = storage.upload_file(bucket, source, path).await?;

    if let Err(e) = record() {
        if !already_existed {
            if let Err(cleanup) = storage.delete_file(bucket, path).await {
                warn!(
                    bucket = %bucket,
                    path = %path.display(),
                    error = %cleanup,
                    "Failed to remove orphaned blob"
                );
            }
        }
        return Err(e);
    }

    Ok(already_existed)
}

/// Upload orchestrator
pub struct Uploader {
    db: Arc<MetadataStore>,
    storage: Arc<dyn BlobStorage>,
    queue: Arc<dyn MessageQueue>,
    temp_path: PathBuf,
    key_prefix: PathBuf,
    server_name: String,
    max_file_size: u64,
    thumbnail_topic: String,
    /// Client-chosen media IDs with an upload in progress
    claims: DashMap<MediaId, ()>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("temp_path", &self.temp_path)
            .field("server_name", &self.server_name)
            .field("max_file_size", &self.max_file_size)
            .finish()
    }
}

impl Uploader {
    pub fn new(
        config: &Config,
        db: Arc<MetadataStore>,
        storage: Arc<dyn BlobStorage>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            db,
            storage,
            queue,
            temp_path: config.storage.temp_path(),
            key_prefix: PathBuf::from(&config.storage.key_prefix),
            server_name: config.server.server_name.clone(),
            max_file_size: config.media.max_file_size_bytes,
            thumbnail_topic: config.queue.thumbnail_topic.clone(),
            claims: DashMap::new(),
        }
    }

    /// Maximum accepted upload size (0 = unlimited)
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Store the bytes of `reader` and return their metadata.
    ///
    /// # Errors
    /// - `Validation` for a bad filename, owner or media ID
    /// - `PayloadTooLarge` when the stream exceeds the configured maximum
    /// - storage and database errors otherwise
    pub async fn upload<R>(&self, request: UploadRequest, reader: R) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        validate_upload_name(&request.upload_name)?;
        validate_owner_id(&request.owner_id)?;

        // Held until the record is stored so concurrent uploads cannot share an ID
        let _claim = match request.media_id {
            Some(ref id) => Some(self.claim_media_id(id)?),
            None => None,
        };

        // Thumbnails are produced internally and are not subject to the limit
        let limit = if self.max_file_size > 0 && request.thumbnail.is_none() {
            self.max_file_size + 1
        } else {
            u64::MAX
        };

        let temp = write_temp_file(reader.take(limit), &self.temp_path).await?;

        if limit != u64::MAX && temp.size > self.max_file_size {
            debug!(
                owner = %request.owner_id,
                max = self.max_file_size,
                "Rejected oversized upload"
            );
            return Err(AppError::payload_too_large(format!(
                "File exceeds the maximum size of {} bytes",
                self.max_file_size
            )));
        }

        // Owner-level dedup applies to originals uploaded under a new ID
        if request.thumbnail.is_none() && request.media_id.is_none() {
            if let Some(existing) = self
                .db
                .get_media_metadata_by_hash(&request.owner_id, &temp.hash)?
            {
                debug!(
                    media_id = %existing.media_id,
                    owner = %request.owner_id,
                    "Duplicate upload, returning existing media"
                );
                return Ok(UploadOutcome::new(existing, true));
            }
        }

        let content_type = resolve_content_type(&request, &temp).await?;
        let (parent_id, thumbnail_size) = match request.thumbnail {
            Some((parent, size)) => (Some(parent), Some(size)),
            None => (None, None),
        };

        let metadata = MediaMetadata {
            media_id: request.media_id.unwrap_or_else(MediaId::generate),
            owner_id: request.owner_id,
            parent_id,
            content_type,
            upload_name: request.upload_name,
            file_size_bytes: temp.size,
            base64_hash: temp.hash.clone(),
            creation_timestamp: chrono::Utc::now(),
            server_name: self.server_name.clone(),
            is_public: request.is_public,
            thumbnail_size,
        };

        self.store(&metadata, &temp).await?;

        if !metadata.is_thumbnail() {
            self.publish_thumbnail_job(&metadata.media_id).await;
        }

        info!(
            media_id = %metadata.media_id,
            owner = %metadata.owner_id,
            size = metadata.file_size_bytes,
            content_type = %metadata.content_type,
            "Stored media"
        );

        Ok(UploadOutcome::new(metadata, false))
    }

    /// Promote the temp file, then persist the record
    async fn store(&self, metadata: &MediaMetadata, temp: &TempUpload) -> Result<()> {
        let bucket = self.storage.bucket(metadata.is_public);
        let path = self.blob_path(&metadata.base64_hash)?;

        let already_existed = promote_then_record(
            self.storage.as_ref(),
            &bucket,
            &temp.file_path(),
            &path,
            || {
                if metadata.is_thumbnail() {
                    self.db.store_thumbnail(metadata)
                } else {
                    self.db.store_media_metadata(metadata)
                }
            },
        )
        .await?;

        if already_existed {
            debug!(hash = %metadata.base64_hash, "Blob already stored, skipping write");
        }

        Ok(())
    }

    /// Reserve a client-chosen media ID until the returned claim is dropped
    fn claim_media_id(&self, media_id: &MediaId) -> Result<MediaIdClaim<'_>> {
        match self.claims.entry(media_id.clone()) {
            Entry::Occupied(_) => {
                return Err(AppError::validation(format!(
                    "Media ID {} is already in use",
                    media_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let claim = MediaIdClaim {
            claims: &self.claims,
            media_id: media_id.clone(),
        };

        if self.db.media_id_exists(media_id)? {
            return Err(AppError::validation(format!(
                "Media ID {} is already in use",
                media_id
            )));
        }

        Ok(claim)
    }

    /// Storage path of a blob
    pub fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        path_from_hash(hash, &self.key_prefix)
    }

    async fn publish_thumbnail_job(&self, media_id: &MediaId) {
        let result = match ThumbnailJob::new(media_id.clone()).to_message() {
            Ok(message) => self.queue.publish(&self.thumbnail_topic, message).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(
                media_id = %media_id,
                topic = %self.thumbnail_topic,
                error = %e,
                "Failed to queue thumbnail generation"
            );
        }
    }

    /// `mxc://` URI for a media ID on this server
    pub fn content_uri(&self, media_id: &MediaId) -> String {
        content_uri(&self.server_name, media_id)
    }
}

/// Pick the content type for a new record.
///
/// A specific client value wins; otherwise the content is sniffed, then the
/// filename extension is consulted.
async fn resolve_content_type(request: &UploadRequest, temp: &TempUpload) -> Result<String> {
    let declared = request.content_type.trim();
    if !declared.is_empty() && !declared.eq_ignore_ascii_case(OCTET_STREAM) {
        return Ok(declared.to_string());
    }

    if let Some(sniffed) = sniff_content_type(&temp.file_path()).await? {
        return Ok(sniffed);
    }

    Ok(mime_guess::from_path(&request.upload_name)
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string())
}

async fn sniff_content_type(path: &Path) -> Result<Option<String>> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(infer::get(&head).map(|kind| kind.mime_type().to_string()))
}
