//! Metadata store using RocksDB.
//!
//! RocksDB provides excellent crash safety through its LSM-tree architecture
//! and write-ahead log (WAL). All writes are atomic and durable.
//!
//! # Data Organization
//!
//! Uses column families to separate data types:
//! - `media`: Metadata records (key: media ID)
//! - `hash_index`: `owner \0 hash` -> media ID (deduplication, originals only)
//! - `owner_index`: `owner \0 timestamp \0 media ID` -> media ID (search)
//! - `thumbnail_index`: `parent \0 width \0 height \0 method` -> media ID
//!
//! Media IDs never contain `\0`, and neither do Matrix user IDs, so the
//! separator keeps prefixes unambiguous.

use crate::error::{AppError, Result};
use crate::models::{MediaId, MediaMetadata, ThumbnailSize};
use rocksdb::{
    ColumnFamilyDescriptor, DBIteratorWithThreadMode, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

type DB = DBWithThreadMode<MultiThreaded>;

/// Column family names
const CF_MEDIA: &str = "media";
const CF_HASH_INDEX: &str = "hash_index";
const CF_OWNER_INDEX: &str = "owner_index";
const CF_THUMBNAIL_INDEX: &str = "thumbnail_index";

/// Key component separator
const SEP: u8 = 0;

/// Default and maximum page sizes for search
pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const MAX_SEARCH_LIMIT: usize = 100;

fn hash_key(owner_id: &str, hash: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner_id.len() + hash.len() + 1);
    key.extend_from_slice(owner_id.as_bytes());
    key.push(SEP);
    key.extend_from_slice(hash.as_bytes());
    key
}

fn owner_prefix(owner_id: &str) -> Vec<u8> {
    let mut key = owner_id.as_bytes().to_vec();
    key.push(SEP);
    key
}

fn owner_key(metadata: &MediaMetadata) -> Vec<u8> {
    let mut key = owner_prefix(&metadata.owner_id);
    // Zero-padded so lexical order is chronological
    let millis = metadata.creation_timestamp.timestamp_millis().max(0);
    key.extend_from_slice(format!("{:020}", millis).as_bytes());
    key.push(SEP);
    key.extend_from_slice(metadata.media_id.as_str().as_bytes());
    key
}

fn thumbnail_prefix(parent_id: &MediaId) -> Vec<u8> {
    let mut key = parent_id.as_str().as_bytes().to_vec();
    key.push(SEP);
    key
}

fn thumbnail_key(parent_id: &MediaId, size: &ThumbnailSize) -> Vec<u8> {
    let mut key = thumbnail_prefix(parent_id);
    key.extend_from_slice(
        format!(
            "{:010}\0{:010}\0{}",
            size.width,
            size.height,
            size.method.as_str()
        )
        .as_bytes(),
    );
    key
}

/// Parameters of a metadata search
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Only media uploaded by this user
    pub owner_id: String,
    /// Case-insensitive substring of upload name or content type; empty matches all
    pub text: String,
    /// Zero-based page number
    pub page: usize,
    /// Page size
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(owner_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            text: text.into(),
            page: 0,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn with_page(mut self, page: usize, limit: usize) -> Self {
        self.page = page;
        self.limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        self
    }

    fn matches(&self, metadata: &MediaMetadata) -> bool {
        if self.text.is_empty() {
            return true;
        }
        let needle = self.text.to_lowercase();
        metadata.upload_name.to_lowercase().contains(&needle)
            || metadata.content_type.to_lowercase().contains(&needle)
    }
}

/// One page of search results
#[derive(Debug)]
pub struct SearchPage {
    pub items: Vec<MediaMetadata>,
    /// True when the page came back full
    pub has_more: bool,
}

/// Lazy search over one owner's media, newest first.
///
/// Each step yields `Some(Ok(item))`, `Some(Err(_))` for a read failure, or
/// `None` when the owner's records are exhausted. The underlying RocksDB
/// iterator is released when this value is dropped.
pub struct SearchResults<'a> {
    store: &'a MetadataStore,
    iter: DBIteratorWithThreadMode<'a, DB>,
    prefix: Vec<u8>,
    query: SearchQuery,
    done: bool,
}

impl Iterator for SearchResults<'_> {
    type Item = Result<MediaMetadata>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let (key, value) = match self.iter.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };

            if !key.starts_with(&self.prefix) {
                self.done = true;
                break;
            }

            let id = String::from_utf8_lossy(&value);
            let media_id = match MediaId::parse(&id) {
                Ok(id) => id,
                Err(_) => {
                    return Some(Err(AppError::internal(format!(
                        "Corrupt owner index entry: {}",
                        id
                    ))))
                }
            };

            match self.store.get_media_metadata(&media_id) {
                Ok(Some(metadata)) if self.query.matches(&metadata) => return Some(Ok(metadata)),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// Metadata store for media and thumbnail records
///
/// Uses RocksDB for high performance and crash safety.
#[derive(Clone)]
pub struct MetadataStore {
    db: Arc<DB>,
    db_path: PathBuf,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.db_path)
            .finish()
    }
}

impl MetadataStore {
    /// Open (or create) the store at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(db_path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Performance tuning
        opts.set_max_open_files(256);
        opts.set_keep_log_file_num(3);
        opts.set_max_total_wal_size(64 * 1024 * 1024); // 64MB
        opts.set_write_buffer_size(32 * 1024 * 1024); // 32MB
        opts.set_max_write_buffer_number(3);

        let cf_names = [CF_MEDIA, CF_HASH_INDEX, CF_OWNER_INDEX, CF_THUMBNAIL_INDEX];
        let cf_descriptors: Vec<_> = cf_names
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&opts, db_path, cf_descriptors)
            .map_err(|e| AppError::internal(format!("Failed to open RocksDB: {}", e)))?;

        info!(path = %db_path.display(), "Metadata store initialized (RocksDB)");

        Ok(Self {
            db: Arc::new(db),
            db_path: db_path.to_path_buf(),
        })
    }

    fn cf(&self, name: &str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| AppError::internal(format!("Missing column family: {}", name)))
    }

    fn get_id(&self, cf_name: &str, key: &[u8]) -> Result<Option<MediaId>> {
        match self.db.get_cf(&self.cf(cf_name)?, key)? {
            Some(bytes) => {
                let id = String::from_utf8_lossy(&bytes);
                Ok(Some(MediaId::parse(&id).map_err(|_| {
                    AppError::internal(format!("Corrupt index entry in {}: {}", cf_name, id))
                })?))
            }
            None => Ok(None),
        }
    }

    // =========================================================================
    // Media operations
    // =========================================================================

    /// Persist metadata for an original upload
    pub fn store_media_metadata(&self, metadata: &MediaMetadata) -> Result<()> {
        let data = serde_json::to_vec(metadata)?;
        let id = metadata.media_id.as_str().as_bytes();

        // Atomic batch write: record + dedup index + owner index
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_MEDIA)?, id, &data);
        batch.put_cf(
            &self.cf(CF_HASH_INDEX)?,
            hash_key(&metadata.owner_id, &metadata.base64_hash),
            id,
        );
        batch.put_cf(&self.cf(CF_OWNER_INDEX)?, owner_key(metadata), id);

        self.db.write(batch)?;

        debug!(media_id = %metadata.media_id, "Stored media metadata");
        Ok(())
    }

    /// Get a metadata record by ID
    pub fn get_media_metadata(&self, media_id: &MediaId) -> Result<Option<MediaMetadata>> {
        match self
            .db
            .get_cf(&self.cf(CF_MEDIA)?, media_id.as_str().as_bytes())?
        {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Find an owner's original upload by content hash
    pub fn get_media_metadata_by_hash(
        &self,
        owner_id: &str,
        hash: &str,
    ) -> Result<Option<MediaMetadata>> {
        match self.get_id(CF_HASH_INDEX, &hash_key(owner_id, hash))? {
            Some(id) => self.get_media_metadata(&id),
            None => Ok(None),
        }
    }

    /// Whether any record uses this media ID
    pub fn media_id_exists(&self, media_id: &MediaId) -> Result<bool> {
        Ok(self
            .db
            .get_pinned_cf(&self.cf(CF_MEDIA)?, media_id.as_str().as_bytes())?
            .is_some())
    }

    /// Get total record count (originals and thumbnails)
    pub fn media_count(&self) -> Result<u64> {
        let mut count = 0u64;
        for item in self.db.iterator_cf(&self.cf(CF_MEDIA)?, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // =========================================================================
    // Thumbnail operations
    // =========================================================================

    /// Persist metadata for a thumbnail
    pub fn store_thumbnail(&self, metadata: &MediaMetadata) -> Result<()> {
        let (parent_id, size) = match (&metadata.parent_id, &metadata.thumbnail_size) {
            (Some(parent), Some(size)) => (parent, size),
            _ => {
                return Err(AppError::internal(format!(
                    "Media {} is not a thumbnail",
                    metadata.media_id
                )))
            }
        };

        let data = serde_json::to_vec(metadata)?;
        let id = metadata.media_id.as_str().as_bytes();

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_MEDIA)?, id, &data);
        batch.put_cf(
            &self.cf(CF_THUMBNAIL_INDEX)?,
            thumbnail_key(parent_id, size),
            id,
        );

        self.db.write(batch)?;

        debug!(
            media_id = %metadata.media_id,
            parent_id = %parent_id,
            size = %size,
            "Stored thumbnail metadata"
        );
        Ok(())
    }

    /// Exact-match thumbnail lookup
    pub fn get_thumbnail(
        &self,
        parent_id: &MediaId,
        size: &ThumbnailSize,
    ) -> Result<Option<MediaMetadata>> {
        match self.get_id(CF_THUMBNAIL_INDEX, &thumbnail_key(parent_id, size))? {
            Some(id) => self.get_media_metadata(&id),
            None => Ok(None),
        }
    }

    /// All stored thumbnails of a media item
    pub fn get_thumbnails(&self, parent_id: &MediaId) -> Result<Vec<MediaMetadata>> {
        let prefix = thumbnail_prefix(parent_id);
        let iter = self.db.iterator_cf(
            &self.cf(CF_THUMBNAIL_INDEX)?,
            IteratorMode::From(&prefix, Direction::Forward),
        );

        let mut thumbnails = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = String::from_utf8_lossy(&value);
            let id = MediaId::parse(&id)
                .map_err(|_| AppError::internal(format!("Corrupt thumbnail index: {}", id)))?;
            if let Some(metadata) = self.get_media_metadata(&id)? {
                thumbnails.push(metadata);
            }
        }

        Ok(thumbnails)
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Lazily search an owner's originals, newest first.
    ///
    /// Pagination is not applied here; see [`MetadataStore::search_page`].
    pub fn search(&self, query: SearchQuery) -> Result<SearchResults<'_>> {
        let prefix = owner_prefix(&query.owner_id);
        // Seek just past the owner's range and walk backwards
        let mut upper = query.owner_id.as_bytes().to_vec();
        upper.push(SEP + 1);

        let iter = self.db.iterator_cf(
            &self.cf(CF_OWNER_INDEX)?,
            IteratorMode::From(&upper, Direction::Reverse),
        );

        Ok(SearchResults {
            store: self,
            iter,
            prefix,
            query,
            done: false,
        })
    }

    /// Collect one page of search results
    pub fn search_page(&self, query: SearchQuery) -> Result<SearchPage> {
        let skip = query.page.saturating_mul(query.limit);
        let limit = query.limit;

        let mut items = Vec::with_capacity(limit);
        for item in self.search(query)?.skip(skip).take(limit) {
            items.push(item?);
        }

        let has_more = items.len() == limit;
        Ok(SearchPage { items, has_more })
    }
}
