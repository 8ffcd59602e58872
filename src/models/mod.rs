//! Data models for the media store.
//!
//! This module contains all data structures used throughout the application:
//! - `MediaMetadata`: persisted record for a stored blob
//! - `ThumbnailSize` / `ResizeMethod`: thumbnail geometry
//! - `MediaId`: validated media identifier

pub mod media;

pub use media::{
    content_uri, is_valid_media_id, MediaId, MediaInfoResponse, MediaMetadata, ResizeMethod,
    ThumbnailSize, UploadResponse, MXC_SCHEME,
};
