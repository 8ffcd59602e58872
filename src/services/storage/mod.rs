//! Blob storage providers.
//!
//! Blobs are addressed by content hash, never by media ID. The hash is mapped
//! to a sharded path with [`path_from_hash`] so no directory (or key prefix)
//! fans out with corpus size:
//!
//! ```text
//! {bucket}/
//! └── u/                 # 1st hash character
//!     └── U/             # 2nd hash character
//!         └── 0nuZNN.../ # remainder of the hash
//!             └── file
//! ```
//!
//! Three backends implement [`BlobStorage`]:
//! - [`LocalStorage`]: a directory per bucket under `base_path`
//! - [`S3Storage`]: AWS S3 or any S3-compatible service
//! - [`GcsStorage`]: Google Cloud Storage
//!
//! The backend is chosen once at startup by [`connect`].

pub mod cloud;
pub mod local;

pub use cloud::{GcsStorage, S3Storage};
pub use local::LocalStorage;

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::config::{StorageConfig, StorageProvider};
use crate::error::{AppError, Result};

/// Name of the blob file at the end of every hash path
pub const BLOB_FILE_NAME: &str = "file";

/// Map a content hash to its sharded storage path under `base_path`.
///
/// `abcdefghijk` becomes `{base_path}/a/b/cdefghijk/file`.
///
/// # Errors
/// Fails if the hash is shorter than 3 characters or contains a path
/// separator.
pub fn path_from_hash(hash: &str, base_path: &Path) -> Result<PathBuf> {
    if hash.len() < 3 || !hash.is_ascii() {
        return Err(AppError::internal(format!(
            "Invalid content hash {:?}: need at least 3 ASCII characters",
            hash
        )));
    }
    if hash.contains(['/', '\\', '.']) {
        return Err(AppError::internal(format!(
            "Invalid content hash {:?}: contains path characters",
            hash
        )));
    }

    Ok(base_path
        .join(&hash[0..1])
        .join(&hash[1..2])
        .join(&hash[2..])
        .join(BLOB_FILE_NAME))
}

/// Streaming reader over a stored blob.
///
/// Dropping the reader releases the underlying file handle or HTTP
/// connection.
pub struct BlobReader {
    inner: Pin<Box<dyn AsyncRead + Send>>,
}

impl BlobReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            inner: Box::pin(reader),
        }
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlobReader")
    }
}

/// Content-addressed blob storage backend
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Prepare the backend (create directories, verify credentials).
    /// Safe to call more than once.
    async fn setup(&self) -> Result<()>;

    /// Bucket name for the given visibility
    fn bucket(&self, is_public: bool) -> String;

    /// Whether a blob exists at `path`
    async fn exists(&self, bucket: &str, path: &Path) -> Result<bool>;

    /// Promote the file at `source` to `dest` in `bucket`.
    ///
    /// Returns `true` without writing when `dest` already exists.
    async fn upload_file(&self, bucket: &str, source: &Path, dest: &Path) -> Result<bool>;

    /// Open a streaming reader for the blob at `path`
    async fn download_file(&self, bucket: &str, path: &Path) -> Result<BlobReader>;

    /// Remove the blob at `path`; missing blobs are not an error
    async fn delete_file(&self, bucket: &str, path: &Path) -> Result<()>;
}

/// Build the configured storage backend.
///
/// The returned provider is not yet set up; call [`BlobStorage::setup`].
pub fn connect(config: &StorageConfig) -> Result<Arc<dyn BlobStorage>> {
    let storage: Arc<dyn BlobStorage> = match config.provider {
        StorageProvider::Local => Arc::new(LocalStorage::new(config)),
        StorageProvider::S3 => Arc::new(S3Storage::new(config)?),
        StorageProvider::Gcs => Arc::new(GcsStorage::new(config)?),
    };
    Ok(storage)
}
