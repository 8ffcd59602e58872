//! Streaming temp-file writer with content hashing.
//!
//! Incoming bytes are copied into a fresh temporary directory while a SHA-256
//! digest and byte count are accumulated. The digest, encoded as unpadded
//! URL-safe base64, is the content-addressing key for the blob store.
//!
//! The temp directory is owned by the returned [`TempUpload`]: dropping it
//! removes the directory, so every exit path of the caller (duplicate,
//! validation failure, store failure, cancelled future) cleans up.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::Result;

/// Read buffer size
const CHUNK_SIZE: usize = 64 * 1024;

/// Name of the content file inside a temp directory
const CONTENT_FILE: &str = "content";

/// A fully written temporary upload
#[derive(Debug)]
pub struct TempUpload {
    dir: TempDir,
    /// Unpadded URL-safe base64 SHA-256 of the content
    pub hash: String,
    /// Number of bytes written
    pub size: u64,
}

impl TempUpload {
    /// Path of the written content
    pub fn file_path(&self) -> PathBuf {
        self.dir.path().join(CONTENT_FILE)
    }

    /// The temp directory holding the content
    pub fn dir_path(&self) -> &Path {
        self.dir.path()
    }
}

/// Stream `reader` into a new temp directory under `base_path`.
///
/// The caller bounds the reader (e.g. `reader.take(max + 1)`) and compares
/// [`TempUpload::size`] against its limit afterwards.
pub async fn write_temp_file<R>(mut reader: R, base_path: &Path) -> Result<TempUpload>
where
    R: AsyncRead + Unpin,
{
    fs::create_dir_all(base_path).await?;
    let dir = tempfile::Builder::new()
        .prefix("upload-")
        .tempdir_in(base_path)?;

    let mut file = fs::File::create(dir.path().join(CONTENT_FILE)).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        size += n as u64;
    }

    file.flush().await?;
    file.sync_all().await?;

    let hash = URL_SAFE_NO_PAD.encode(hasher.finalize());

    debug!(
        path = %dir.path().display(),
        size = size,
        hash = %hash,
        "Wrote temp upload"
    );

    Ok(TempUpload { dir, hash, size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_hash_and_size() {
        let base = TempDir::new().unwrap();
        let upload = write_temp_file(&b"hello world"[..], base.path()).await.unwrap();

        assert_eq!(upload.size, 11);
        // sha256("hello world"), unpadded url-safe base64
        assert_eq!(upload.hash, "uU0nuZNNPgilLlLX2n2r-sSE7-N6U4DukIj3rOLvzek");
        assert_eq!(fs::read(upload.file_path()).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_identical_content_identical_hash() {
        let base = TempDir::new().unwrap();
        let a = write_temp_file(&b"same bytes"[..], base.path()).await.unwrap();
        let b = write_temp_file(&b"same bytes"[..], base.path()).await.unwrap();

        assert_eq!(a.hash, b.hash);
        assert_ne!(a.dir_path(), b.dir_path());
    }

    #[tokio::test]
    async fn test_drop_removes_temp_dir() {
        let base = TempDir::new().unwrap();
        let upload = write_temp_file(&b"bytes"[..], base.path()).await.unwrap();
        let dir = upload.dir_path().to_path_buf();
        assert!(dir.exists());

        drop(upload);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_limited_reader_reports_overflow() {
        let base = TempDir::new().unwrap();
        let data = vec![7u8; 14];
        let max = 8u64;
        let upload = write_temp_file((&data[..]).take(max + 1), base.path())
            .await
            .unwrap();

        assert_eq!(upload.size, max + 1);
    }
}
