//! Object-store backed blob storage (S3 and GCS).
//!
//! Both providers share [`ObjectBuckets`], which owns one `object_store`
//! client per bucket. Clients are built once at startup and shared across
//! requests; `setup` issues a listing call so bad credentials fail the
//! process at boot rather than on the first upload.
//!
//! Uploads stream the temp file as a multipart upload, so memory use is
//! bounded by the part size regardless of the file size.

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::{
    aws::AmazonS3Builder, gcp::GoogleCloudStorageBuilder, path::Path as ObjectPath, ObjectStore,
    WriteMultipart,
};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use super::{BlobReader, BlobStorage};
use crate::config::StorageConfig;
use crate::error::{AppError, Result};

/// Multipart part size; S3 requires at least 5 MiB for all but the last part
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Parts uploaded concurrently before reading more of the source
const MAX_PARTS_IN_FLIGHT: usize = 4;

/// Read buffer size when streaming a temp file
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Public and private bucket clients
#[derive(Clone)]
pub struct ObjectBuckets {
    public_name: String,
    public: Arc<dyn ObjectStore>,
    private_name: String,
    private: Arc<dyn ObjectStore>,
    /// Multipart upload part size
    part_size: usize,
}

impl std::fmt::Debug for ObjectBuckets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBuckets")
            .field("public", &self.public_name)
            .field("private", &self.private_name)
            .finish()
    }
}

/// Convert a relative filesystem-style path into an object key
fn object_key(path: &Path) -> ObjectPath {
    ObjectPath::from_iter(
        path.iter()
            .map(|part| part.to_string_lossy().into_owned()),
    )
}

/// Stream `source` into `writer`, returning the bytes written
async fn write_parts(source: &Path, writer: &mut WriteMultipart) -> Result<u64> {
    let mut file = tokio::fs::File::open(source).await?;
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await?;
        writer.write(&buf[..n]);
        size += n as u64;
    }

    Ok(size)
}

impl ObjectBuckets {
    fn new(
        public_name: String,
        public: Arc<dyn ObjectStore>,
        private_name: String,
        private: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            public_name,
            public,
            private_name,
            private,
            part_size: PART_SIZE,
        }
    }

    fn store(&self, bucket: &str) -> Result<&Arc<dyn ObjectStore>> {
        if bucket == self.public_name {
            Ok(&self.public)
        } else if bucket == self.private_name {
            Ok(&self.private)
        } else {
            Err(AppError::not_found(format!("Unknown bucket: {}", bucket)))
        }
    }

    async fn setup(&self) -> Result<()> {
        for (name, store) in [(&self.public_name, &self.public), (&self.private_name, &self.private)]
        {
            store.list_with_delimiter(None).await.map_err(|e| {
                AppError::config(format!("Cannot access bucket {}: {}", name, e))
            })?;
        }
        Ok(())
    }

    fn bucket(&self, is_public: bool) -> String {
        if is_public {
            self.public_name.clone()
        } else {
            self.private_name.clone()
        }
    }

    async fn exists(&self, bucket: &str, path: &Path) -> Result<bool> {
        let store = self.store(bucket)?;
        match store.head(&object_key(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_file(&self, bucket: &str, source: &Path, dest: &Path) -> Result<bool> {
        if self.exists(bucket, dest).await? {
            debug!(bucket = %bucket, key = %dest.display(), "Object already stored");
            return Ok(true);
        }

        let store = self.store(bucket)?;
        let upload = store.put_multipart(&object_key(dest)).await?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.part_size);

        let size = match write_parts(source, &mut writer).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!(bucket = %bucket, key = %dest.display(), error = %abort, "Failed to abort upload");
                }
                return Err(e);
            }
        };
        writer.finish().await?;

        debug!(bucket = %bucket, key = %dest.display(), size = size, "Uploaded object");
        Ok(false)
    }

    async fn download_file(&self, bucket: &str, path: &Path) -> Result<BlobReader> {
        let store = self.store(bucket)?;
        let result = store.get(&object_key(path)).await?;

        let stream = result
            .into_stream()
            .map_err(std::io::Error::other);

        Ok(BlobReader::new(StreamReader::new(stream)))
    }

    async fn delete_file(&self, bucket: &str, path: &Path) -> Result<()> {
        let store = self.store(bucket)?;
        match store.delete(&object_key(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => {
                warn!(bucket = %bucket, key = %path.display(), error = %e, "Failed to delete object");
                Err(e.into())
            }
        }
    }
}

/// Blob storage on AWS S3 or an S3-compatible service
#[derive(Debug, Clone)]
pub struct S3Storage {
    buckets: ObjectBuckets,
}

impl S3Storage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let s3 = config
            .s3
            .as_ref()
            .ok_or_else(|| AppError::config("[storage.s3] section is required"))?;

        let build = |bucket: &str| -> Result<Arc<dyn ObjectStore>> {
            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(&s3.region)
                .with_allow_http(s3.allow_http);

            if let Some(ref endpoint) = s3.endpoint {
                builder = builder.with_endpoint(endpoint);
            }
            if let Some(ref access_key_id) = s3.access_key_id {
                builder = builder.with_access_key_id(access_key_id);
            }
            if let Some(ref secret_access_key) = s3.secret_access_key {
                builder = builder.with_secret_access_key(secret_access_key);
            }

            Ok(Arc::new(builder.build().map_err(|e| {
                AppError::config(format!("Failed to build S3 store: {}", e))
            })?))
        };

        Ok(Self {
            buckets: ObjectBuckets::new(
                config.public_bucket.clone(),
                build(&config.public_bucket)?,
                config.private_bucket.clone(),
                build(&config.private_bucket)?,
            ),
        })
    }
}

#[async_trait]
impl BlobStorage for S3Storage {
    async fn setup(&self) -> Result<()> {
        self.buckets.setup().await?;
        info!(buckets = ?self.buckets, "S3 storage initialized");
        Ok(())
    }

    fn bucket(&self, is_public: bool) -> String {
        self.buckets.bucket(is_public)
    }

    async fn exists(&self, bucket: &str, path: &Path) -> Result<bool> {
        self.buckets.exists(bucket, path).await
    }

    async fn upload_file(&self, bucket: &str, source: &Path, dest: &Path) -> Result<bool> {
        self.buckets.upload_file(bucket, source, dest).await
    }

    async fn download_file(&self, bucket: &str, path: &Path) -> Result<BlobReader> {
        self.buckets.download_file(bucket, path).await
    }

    async fn delete_file(&self, bucket: &str, path: &Path) -> Result<()> {
        self.buckets.delete_file(bucket, path).await
    }
}

/// Blob storage on Google Cloud Storage
#[derive(Debug, Clone)]
pub struct GcsStorage {
    buckets: ObjectBuckets,
}

impl GcsStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let gcs = config
            .gcs
            .as_ref()
            .ok_or_else(|| AppError::config("[storage.gcs] section is required"))?;

        let build = |bucket: &str| -> Result<Arc<dyn ObjectStore>> {
            let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);

            if let Some(ref service_account) = gcs.service_account_path {
                builder = builder.with_service_account_path(service_account);
            }

            Ok(Arc::new(builder.build().map_err(|e| {
                AppError::config(format!("Failed to build GCS store: {}", e))
            })?))
        };

        Ok(Self {
            buckets: ObjectBuckets::new(
                config.public_bucket.clone(),
                build(&config.public_bucket)?,
                config.private_bucket.clone(),
                build(&config.private_bucket)?,
            ),
        })
    }
}

#[async_trait]
impl BlobStorage for GcsStorage {
    async fn setup(&self) -> Result<()> {
        self.buckets.setup().await?;
        info!(buckets = ?self.buckets, "GCS storage initialized");
        Ok(())
    }

    fn bucket(&self, is_public: bool) -> String {
        self.buckets.bucket(is_public)
    }

    async fn exists(&self, bucket: &str, path: &Path) -> Result<bool> {
        self.buckets.exists(bucket, path).await
    }

    async fn upload_file(&self, bucket: &str, source: &Path, dest: &Path) -> Result<bool> {
        self.buckets.upload_file(bucket, source, dest).await
    }

    async fn download_file(&self, bucket: &str, path: &Path) -> Result<BlobReader> {
        self.buckets.download_file(bucket, path).await
    }

    async fn delete_file(&self, bucket: &str, path: &Path) -> Result<()> {
        self.buckets.delete_file(bucket, path).await
    }
}
