//! Local filesystem blob storage.
//!
//! Each bucket is a directory under `base_path`. Promotion renames the temp
//! file into place, which is atomic on a single filesystem; a copy into a
//! sibling `.partial` file followed by a rename covers temp areas mounted
//! elsewhere.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{BlobReader, BlobStorage};
use crate::config::StorageConfig;
use crate::error::{AppError, Result};

/// Filesystem-backed storage
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Root directory holding one directory per bucket
    root: PathBuf,
    public_bucket: String,
    private_bucket: String,
}

impl LocalStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.base_path.clone(),
            public_bucket: config.public_bucket.clone(),
            private_bucket: config.private_bucket.clone(),
        }
    }

    /// Absolute path of a blob
    fn blob_path(&self, bucket: &str, path: &Path) -> Result<PathBuf> {
        if bucket != self.public_bucket && bucket != self.private_bucket {
            return Err(AppError::not_found(format!("Unknown bucket: {}", bucket)));
        }
        Ok(self.root.join(bucket).join(path))
    }

    /// Ensure parent directory exists before writing a file
    async fn ensure_parent(file_path: &Path) -> Result<()> {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for LocalStorage {
    async fn setup(&self) -> Result<()> {
        for bucket in [&self.public_bucket, &self.private_bucket] {
            let dir = self.root.join(bucket);
            if !dir.exists() {
                fs::create_dir_all(&dir).await?;
                debug!(path = %dir.display(), "Created bucket directory");
            }
        }

        info!(
            root = %self.root.display(),
            public = %self.public_bucket,
            private = %self.private_bucket,
            "Local storage initialized"
        );

        Ok(())
    }

    fn bucket(&self, is_public: bool) -> String {
        if is_public {
            self.public_bucket.clone()
        } else {
            self.private_bucket.clone()
        }
    }

    async fn exists(&self, bucket: &str, path: &Path) -> Result<bool> {
        let full = self.blob_path(bucket, path)?;
        Ok(fs::try_exists(&full).await?)
    }

    async fn upload_file(&self, bucket: &str, source: &Path, dest: &Path) -> Result<bool> {
        let full = self.blob_path(bucket, dest)?;

        if fs::try_exists(&full).await? {
            debug!(bucket = %bucket, path = %dest.display(), "Blob already stored");
            return Ok(true);
        }

        Self::ensure_parent(&full).await?;

        if let Err(e) = fs::rename(source, &full).await {
            debug!(error = %e, "Rename failed, falling back to copy");
            let partial = full.with_extension("partial");
            fs::copy(source, &partial).await?;
            fs::rename(&partial, &full).await?;
        }

        debug!(bucket = %bucket, path = %dest.display(), "Stored blob");
        Ok(false)
    }

    async fn download_file(&self, bucket: &str, path: &Path) -> Result<BlobReader> {
        let full = self.blob_path(bucket, path)?;

        match fs::File::open(&full).await {
            Ok(file) => Ok(BlobReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::not_found(
                format!("Blob not found: {}/{}", bucket, path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, bucket: &str, path: &Path) -> Result<()> {
        let full = self.blob_path(bucket, path)?;

        match fs::remove_file(&full).await {
            Ok(()) => {
                debug!(bucket = %bucket, path = %path.display(), "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(bucket = %bucket, path = %path.display(), error = %e, "Failed to delete blob");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageProvider;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            provider: StorageProvider::Local,
            base_path: temp_dir.path().to_path_buf(),
            temp_dir: "tmp".to_string(),
            database_dir: "rocksdb".to_string(),
            key_prefix: String::new(),
            public_bucket: "public".to_string(),
            private_bucket: "private".to_string(),
            s3: None,
            gcs: None,
        };

        let storage = LocalStorage::new(&config);
        storage.setup().await.unwrap();
        (storage, temp_dir)
    }

    async fn write_source(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let (storage, temp) = create_test_storage().await;
        let source = write_source(&temp, "src", b"blob bytes").await;
        let dest = Path::new("a/b/cdef/file");

        let existed = storage.upload_file("private", &source, dest).await.unwrap();
        assert!(!existed);
        assert!(storage.exists("private", dest).await.unwrap());

        let mut reader = storage.download_file("private", dest).await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"blob bytes");
    }

    #[tokio::test]
    async fn test_second_upload_reports_existing() {
        let (storage, temp) = create_test_storage().await;
        let dest = Path::new("a/b/cdef/file");

        let first = write_source(&temp, "one", b"same").await;
        assert!(!storage.upload_file("public", &first, dest).await.unwrap());

        let second = write_source(&temp, "two", b"same").await;
        assert!(storage.upload_file("public", &second, dest).await.unwrap());
        // The duplicate source is left for its owner to clean up
        assert!(second.exists());
    }

    #[tokio::test]
    async fn test_buckets_are_separate() {
        let (storage, temp) = create_test_storage().await;
        let source = write_source(&temp, "src", b"x").await;
        let dest = Path::new("x/y/z/file");

        storage.upload_file("public", &source, dest).await.unwrap();
        assert!(storage.exists("public", dest).await.unwrap());
        assert!(!storage.exists("private", dest).await.unwrap());
        assert_eq!(storage.bucket(true), "public");
        assert_eq!(storage.bucket(false), "private");
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let (storage, _temp) = create_test_storage().await;
        let err = storage
            .download_file("public", Path::new("n/o/pe/file"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_bucket_rejected() {
        let (storage, _temp) = create_test_storage().await;
        assert!(storage.exists("elsewhere", Path::new("a/b/c/file")).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (storage, temp) = create_test_storage().await;
        let source = write_source(&temp, "src", b"x").await;
        let dest = Path::new("d/e/f/file");

        storage.upload_file("private", &source, dest).await.unwrap();
        storage.delete_file("private", dest).await.unwrap();
        assert!(!storage.exists("private", dest).await.unwrap());
        storage.delete_file("private", dest).await.unwrap();
    }
}
