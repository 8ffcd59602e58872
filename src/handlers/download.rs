//! Media serving handlers.
//!
//! ## Endpoints
//!
//! - `GET /_matrix/media/v3/download/{serverName}/{mediaId}` - Serve the original
//! - `GET /_matrix/media/v3/download/{serverName}/{mediaId}/{fileName}` - Same, with a filename override
//! - `GET /_matrix/media/v3/thumbnail/{serverName}/{mediaId}?width=&height=&method=` - Serve a thumbnail
//!
//! ## Headers
//!
//! - `Content-Disposition: inline` only for a safe list of types, else `attachment`
//! - `Cache-Control` from config for local media
//! - `ETag` based on content hash
//! - `X-Content-Type-Options: nosniff` and a restrictive CSP

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::ResizeMethod;
use crate::services::downloader::CONTENT_SECURITY_POLICY;
use crate::services::{Download, ThumbnailRequest};
use crate::state::AppState;

/// Query parameters of a thumbnail request
#[derive(Debug, Deserialize)]
pub struct ThumbnailQuery {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub method: Option<String>,
}

impl ThumbnailQuery {
    fn into_request(self) -> Result<ThumbnailRequest> {
        let (Some(width), Some(height)) = (self.width, self.height) else {
            return Err(AppError::validation("width and height are required"));
        };
        let method = self
            .method
            .map(|m| m.parse::<ResizeMethod>())
            .transpose()?;

        Ok(ThumbnailRequest {
            width,
            height,
            method,
        })
    }
}

/// Turn a resolved download into a streaming response
fn stream_response(download: Download, headers: &HeaderMap) -> Result<Response> {
    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH) {
        if if_none_match.to_str().unwrap_or("") == download.etag {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    let media_id = download.metadata.media_id.clone();
    let stream = ReaderStream::new(download.reader).inspect_err(move |e| {
        warn!(media_id = %media_id, error = %e, "Failed while streaming media");
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &download.content_type)
        .header(header::CONTENT_LENGTH, download.content_length)
        .header(header::CONTENT_DISPOSITION, &download.content_disposition)
        .header(header::CACHE_CONTROL, &download.cache_control)
        .header(header::ETAG, &download.etag)
        .header("X-Content-Type-Options", "nosniff")
        .header(header::CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY)
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::internal(format!("Failed to build response: {}", e)))?;

    debug!(media_id = %download.metadata.media_id, "Serving media");

    Ok(response)
}

/// Serve original media
///
/// GET /_matrix/media/v3/download/{serverName}/{mediaId}
async fn download(
    State(state): State<AppState>,
    Path((server_name, media_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let download = state
        .downloader
        .download(&server_name, &media_id, None, None)
        .await?;
    stream_response(download, &headers)
}

/// Serve original media under a different filename
///
/// GET /_matrix/media/v3/download/{serverName}/{mediaId}/{fileName}
async fn download_named(
    State(state): State<AppState>,
    Path((server_name, media_id, file_name)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let download = state
        .downloader
        .download(&server_name, &media_id, None, Some(file_name))
        .await?;
    stream_response(download, &headers)
}

/// Serve a thumbnail
///
/// GET /_matrix/media/v3/thumbnail/{serverName}/{mediaId}
async fn thumbnail(
    State(state): State<AppState>,
    Path((server_name, media_id)): Path<(String, String)>,
    Query(query): Query<ThumbnailQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let request = query.into_request()?;
    let download = state
        .downloader
        .download(&server_name, &media_id, Some(request), None)
        .await?;
    stream_response(download, &headers)
}

/// Create download routes
pub fn download_routes() -> Router<AppState> {
    Router::new()
        .route("/download/{server_name}/{media_id}", get(download))
        .route(
            "/download/{server_name}/{media_id}/{file_name}",
            get(download_named),
        )
        .route("/thumbnail/{server_name}/{media_id}", get(thumbnail))
}
