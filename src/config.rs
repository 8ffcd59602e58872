//! Configuration module for the media store.
//!
//! This module handles loading and validating configuration from TOML files.
//! Configuration can be loaded from a file path or from default locations.
//!
//! # Configuration Sources (in order of priority)
//! 1. `config.local.toml` - Local overrides (gitignored)
//! 2. `config.toml` - Main configuration file
//!
//! # Example
//! ```rust,ignore
//! let config = Config::load("config.toml")?;
//! println!("Serving media for {}", config.server.server_name);
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::models::{ResizeMethod, ThumbnailSize};

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub media: MediaConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Access token -> owner user ID (e.g. `@alice:example.org`)
    #[serde(default)]
    pub access_tokens: HashMap<String, String>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the API to
    pub host: String,
    /// Port for the API
    pub port: u16,
    /// Matrix server name used in `mxc://` content URIs
    pub server_name: String,
    /// Cache-Control max-age in seconds for locally originated media
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age: u64,
}

fn default_cache_max_age() -> u64 {
    300
}

/// Which blob storage backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    Local,
    S3,
    Gcs,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Blob storage backend
    #[serde(default = "default_provider")]
    pub provider: StorageProvider,
    /// Base directory for local blobs, temp files and the database
    pub base_path: PathBuf,
    /// Directory for temporary uploads (relative to base_path)
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// Directory for RocksDB (relative to base_path)
    #[serde(default = "default_database_dir")]
    pub database_dir: String,
    /// Optional prefix prepended to every blob key
    #[serde(default)]
    pub key_prefix: String,
    /// Bucket (or local directory) for public media
    #[serde(default = "default_public_bucket")]
    pub public_bucket: String,
    /// Bucket (or local directory) for private media
    #[serde(default = "default_private_bucket")]
    pub private_bucket: String,
    /// S3 credentials, required when provider = "s3"
    #[serde(default)]
    pub s3: Option<S3Config>,
    /// GCS credentials, required when provider = "gcs"
    #[serde(default)]
    pub gcs: Option<GcsConfig>,
}

fn default_provider() -> StorageProvider {
    StorageProvider::Local
}

fn default_temp_dir() -> String {
    "tmp".to_string()
}

fn default_database_dir() -> String {
    "rocksdb".to_string()
}

fn default_public_bucket() -> String {
    "public".to_string()
}

fn default_private_bucket() -> String {
    "private".to_string()
}

impl StorageConfig {
    /// Get the full path to the temp directory
    pub fn temp_path(&self) -> PathBuf {
        self.base_path.join(&self.temp_dir)
    }

    /// Get the full path to the database directory
    pub fn database_path(&self) -> PathBuf {
        self.base_path.join(&self.database_dir)
    }
}

/// S3 (or S3-compatible) credentials
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO etc.)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

/// Google Cloud Storage credentials
#[derive(Debug, Clone, Deserialize)]
pub struct GcsConfig {
    /// Path to a service account JSON file
    #[serde(default)]
    pub service_account_path: Option<String>,
}

/// What to do when a requested thumbnail size was never generated
/// and dynamic generation is disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailFallback {
    /// Serve the closest pre-generated thumbnail
    #[default]
    Nearest,
    /// Respond with 404
    NotFound,
}

/// Media handling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Maximum upload size in bytes (0 = unlimited)
    #[serde(default)]
    pub max_file_size_bytes: u64,
    /// Generate missing thumbnail sizes on request
    #[serde(default)]
    pub dynamic_thumbnails: bool,
    /// Policy when dynamic thumbnails are off
    #[serde(default)]
    pub thumbnail_fallback: ThumbnailFallback,
    /// Largest width or height a client may request
    #[serde(default = "default_max_thumbnail_dimension")]
    pub max_thumbnail_dimension: u32,
    /// Concurrent thumbnail generations allowed
    #[serde(default = "default_max_thumbnail_generators")]
    pub max_thumbnail_generators: usize,
    /// Sizes generated after every image upload
    #[serde(default)]
    pub thumbnail_sizes: Vec<ThumbnailSizeConfig>,
}

fn default_max_thumbnail_dimension() -> u32 {
    2048
}

fn default_max_thumbnail_generators() -> usize {
    4
}

/// One pre-generated thumbnail size
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ThumbnailSizeConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub method: ResizeMethod,
}

impl From<ThumbnailSizeConfig> for ThumbnailSize {
    fn from(c: ThumbnailSizeConfig) -> Self {
        ThumbnailSize::new(c.width, c.height, c.method)
    }
}

impl MediaConfig {
    /// Configured pre-generated sizes as domain values
    pub fn thumbnail_sizes(&self) -> Vec<ThumbnailSize> {
        self.thumbnail_sizes.iter().copied().map(Into::into).collect()
    }
}

/// Thumbnail queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Topic carrying `{"media_id": ...}` messages
    #[serde(default = "default_thumbnail_topic")]
    pub thumbnail_topic: String,
    /// Number of consumer tasks
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_thumbnail_topic() -> String {
    "media.thumbnails".to_string()
}

fn default_workers() -> usize {
    1
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            thumbnail_topic: default_thumbnail_topic(),
            workers: default_workers(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Config {
    /// Load configuration from a file path
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed or validated
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Tries to load from:
    /// 1. `config.local.toml` (if exists)
    /// 2. `config.toml`
    pub fn load_default() -> Result<Self, ConfigError> {
        if Path::new("config.local.toml").exists() {
            return Self::load("config.local.toml");
        }

        if Path::new("config.toml").exists() {
            return Self::load("config.toml");
        }

        Err(ConfigError::ValidationError(
            "No configuration file found. Expected config.toml or config.local.toml".to_string(),
        ))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.server_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "server_name must not be empty".to_string(),
            ));
        }

        if self.storage.public_bucket.is_empty() || self.storage.private_bucket.is_empty() {
            return Err(ConfigError::ValidationError(
                "public_bucket and private_bucket must not be empty".to_string(),
            ));
        }

        // Local buckets share base_path with the temp and database directories
        for bucket in [&self.storage.public_bucket, &self.storage.private_bucket] {
            if bucket == &self.storage.temp_dir || bucket == &self.storage.database_dir {
                return Err(ConfigError::ValidationError(format!(
                    "bucket {:?} collides with temp_dir or database_dir",
                    bucket
                )));
            }
        }

        let prefix_is_relative = Path::new(&self.storage.key_prefix)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !prefix_is_relative {
            return Err(ConfigError::ValidationError(format!(
                "key_prefix {:?} must be a relative path without '..'",
                self.storage.key_prefix
            )));
        }

        match self.storage.provider {
            StorageProvider::S3 if self.storage.s3.is_none() => {
                return Err(ConfigError::ValidationError(
                    "provider \"s3\" requires a [storage.s3] section".to_string(),
                ));
            }
            StorageProvider::Gcs if self.storage.gcs.is_none() => {
                return Err(ConfigError::ValidationError(
                    "provider \"gcs\" requires a [storage.gcs] section".to_string(),
                ));
            }
            _ => {}
        }

        let cap = self.media.max_thumbnail_dimension;
        for size in &self.media.thumbnail_sizes {
            if size.width == 0 || size.height == 0 || size.width > cap || size.height > cap {
                return Err(ConfigError::ValidationError(format!(
                    "thumbnail size {}x{} must be between 1 and {}",
                    size.width, size.height, cap
                )));
            }
        }

        if self.media.max_thumbnail_generators == 0 {
            return Err(ConfigError::ValidationError(
                "max_thumbnail_generators must be at least 1".to_string(),
            ));
        }

        if self.queue.workers == 0 {
            return Err(ConfigError::ValidationError(
                "queue.workers must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
