//! Media metadata model and related types.
//!
//! This module defines `MediaMetadata`, the record persisted for every stored
//! blob (originals and thumbnails alike), plus the small value types used to
//! address and describe it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Scheme prefix of Matrix content URIs
pub const MXC_SCHEME: &str = "mxc://";

/// Opaque media identifier.
///
/// Only `[A-Za-z0-9_=-]` is allowed, which keeps IDs safe to embed in URLs,
/// storage keys and RocksDB index keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MediaId(String);

impl<'de> Deserialize<'de> for MediaId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = String::deserialize(deserializer)?;
        Self::parse(&id).map_err(serde::de::Error::custom)
    }
}

impl MediaId {
    /// Generate a new server-assigned ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().as_simple().to_string())
    }

    /// Validate a client-supplied ID
    pub fn parse(id: &str) -> Result<Self> {
        if is_valid_media_id(id) {
            Ok(Self(id.to_string()))
        } else {
            Err(AppError::validation(format!(
                "Media ID must match [A-Za-z0-9_=-]+, got {:?}",
                id
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check a media ID against the allowed character set
pub fn is_valid_media_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '-'))
}

/// How a thumbnail is fitted to its requested box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMethod {
    /// Fill the box exactly, cropping the excess
    Crop,
    /// Fit inside the box, preserving aspect ratio
    #[default]
    Scale,
}

impl ResizeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crop => "crop",
            Self::Scale => "scale",
        }
    }
}

impl FromStr for ResizeMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "crop" => Ok(Self::Crop),
            "scale" => Ok(Self::Scale),
            other => Err(AppError::validation(format!(
                "Unknown thumbnail method {:?}, expected \"crop\" or \"scale\"",
                other
            ))),
        }
    }
}

impl fmt::Display for ResizeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested (or stored) thumbnail dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
    pub method: ResizeMethod,
}

impl ThumbnailSize {
    pub fn new(width: u32, height: u32, method: ResizeMethod) -> Self {
        Self {
            width,
            height,
            method,
        }
    }

    /// Pixel area, used to rank candidate thumbnails
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}:{}", self.width, self.height, self.method)
    }
}

/// Metadata for one stored content blob plus its upload context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// Unique identifier
    pub media_id: MediaId,

    /// User ID of the uploader
    pub owner_id: String,

    /// Origin media ID when this record is a thumbnail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MediaId>,

    /// MIME type of the stored bytes
    pub content_type: String,

    /// Filename supplied by the uploader
    pub upload_name: String,

    /// Size of the stored bytes
    pub file_size_bytes: u64,

    /// Unpadded URL-safe base64 SHA-256 of the content; derives the blob path
    pub base64_hash: String,

    /// Creation timestamp
    pub creation_timestamp: DateTime<Utc>,

    /// Server the media originated from
    pub server_name: String,

    /// Whether the blob lives in the public bucket
    pub is_public: bool,

    /// Present only on thumbnail records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_size: Option<ThumbnailSize>,
}

impl MediaMetadata {
    /// `mxc://{server_name}/{media_id}`
    pub fn content_uri(&self) -> String {
        content_uri(&self.server_name, &self.media_id)
    }

    pub fn is_thumbnail(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Whether the content type is an image format the thumbnailer can decode
    pub fn is_thumbnailable(&self) -> bool {
        is_decodable_image(&self.content_type)
    }
}

/// Whether `content_type` names an image format with decoding support
pub fn is_decodable_image(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    image::ImageFormat::from_mime_type(essence.to_ascii_lowercase())
        .is_some_and(|format| format.reading_enabled())
}

/// Build a Matrix content URI
pub fn content_uri(server_name: &str, media_id: &MediaId) -> String {
    format!("{}{}/{}", MXC_SCHEME, server_name, media_id)
}

/// Response DTO for a successful upload
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    /// `mxc://` URI of the stored media
    pub content_uri: String,
    pub media_id: String,
    pub server_name: String,
}

impl UploadResponse {
    pub fn from_metadata(metadata: &MediaMetadata) -> Self {
        Self {
            content_uri: metadata.content_uri(),
            media_id: metadata.media_id.to_string(),
            server_name: metadata.server_name.clone(),
        }
    }
}

/// Public view of a metadata record, used by search results
#[derive(Debug, Serialize)]
pub struct MediaInfoResponse {
    pub media_id: String,
    pub content_uri: String,
    pub content_type: String,
    pub upload_name: String,
    pub file_size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl MediaInfoResponse {
    pub fn from_metadata(metadata: &MediaMetadata) -> Self {
        Self {
            media_id: metadata.media_id.to_string(),
            content_uri: metadata.content_uri(),
            content_type: metadata.content_type.clone(),
            upload_name: metadata.upload_name.clone(),
            file_size_bytes: metadata.file_size_bytes,
            created_at: metadata.creation_timestamp,
        }
    }
}
