//! Service layer for the media store.
//!
//! - `hasher`: streaming temp writer with content hashing
//! - `storage`: hash-path mapping and blob storage backends
//! - `database`: metadata store (RocksDB)
//! - `uploader`: deduplicating upload orchestrator
//! - `thumbnailer`: thumbnail generation
//! - `downloader`: download resolution
//! - `queue` / `worker`: background thumbnail jobs

pub mod database;
pub mod downloader;
pub mod hasher;
pub mod queue;
pub mod storage;
pub mod thumbnailer;
pub mod uploader;
pub mod worker;

pub use database::{MetadataStore, SearchPage, SearchQuery};
pub use downloader::{Download, Downloader, ThumbnailRequest};
pub use queue::{LocalQueue, MessageQueue};
pub use storage::BlobStorage;
pub use thumbnailer::{GenerateOutcome, Thumbnailer};
pub use uploader::{UploadOutcome, UploadRequest, Uploader};
pub use worker::ThumbnailWorker;
