//! Upload handlers.
//!
//! The request body is the raw file; it is streamed to disk while hashed,
//! so uploads are never buffered in memory.
//!
//! ## Endpoints
//!
//! - `POST /_matrix/media/v3/upload?filename=&public=` - Upload with a new media ID
//! - `PUT /_matrix/media/v3/upload/{serverName}/{mediaId}?filename=` - Upload to a chosen media ID
//! - `GET /_matrix/media/v3/config` - Upload limits
//!
//! # Example
//!
//! ```bash
//! curl -X POST "http://localhost:8008/_matrix/media/v3/upload?filename=cat.png" \
//!   -H "Authorization: Bearer <token>" \
//!   -H "Content-Type: image/png" \
//!   --data-binary @cat.png
//! ```

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    routing::{get, post, put},
    Json, Router,
};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::StreamReader;
use tracing::info;

use crate::error::{AppError, Result};
use crate::middleware::AuthenticatedUser;
use crate::models::{MediaId, UploadResponse};
use crate::services::UploadRequest;
use crate::state::AppState;

/// Query parameters of an upload
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    /// Original filename
    #[serde(default)]
    pub filename: Option<String>,
    /// Store in the public bucket
    #[serde(default)]
    pub public: bool,
}

/// Reject bodies whose declared length already exceeds the limit
fn check_declared_length(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let max = state.max_upload_size();
    if max == 0 {
        return Ok(());
    }

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    match declared {
        Some(len) if len > max => Err(AppError::payload_too_large(format!(
            "File exceeds the maximum size of {} bytes",
            max
        ))),
        _ => Ok(()),
    }
}

fn declared_content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn store_body(
    state: &AppState,
    user: AuthenticatedUser,
    query: UploadQuery,
    headers: &HeaderMap,
    media_id: Option<MediaId>,
    body: Body,
) -> Result<Json<UploadResponse>> {
    check_declared_length(state, headers)?;

    let request = UploadRequest {
        owner_id: user.user_id,
        upload_name: query.filename.unwrap_or_default(),
        content_type: declared_content_type(headers),
        is_public: query.public,
        media_id,
        thumbnail: None,
    };

    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let outcome = state
        .uploader
        .upload(request, StreamReader::new(stream))
        .await?;

    info!(
        media_id = %outcome.metadata.media_id,
        deduplicated = outcome.deduplicated,
        "Upload complete"
    );

    Ok(Json(UploadResponse::from_metadata(&outcome.metadata)))
}

/// Upload a file under a new media ID
///
/// POST /_matrix/media/v3/upload
async fn upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadResponse>> {
    store_body(&state, user, query, &headers, None, body).await
}

/// Upload a file to a client-chosen media ID
///
/// PUT /_matrix/media/v3/upload/{serverName}/{mediaId}
async fn upload_to(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((server_name, media_id)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadResponse>> {
    if server_name != state.server_name() {
        return Err(AppError::validation(format!(
            "Cannot upload media for server {}",
            server_name
        )));
    }
    let media_id = MediaId::parse(&media_id)?;

    store_body(&state, user, query, &headers, Some(media_id), body).await
}

/// Upload limits advertised to clients
///
/// GET /_matrix/media/v3/config
async fn media_config(State(state): State<AppState>) -> Json<Value> {
    let max = state.max_upload_size();
    if max > 0 {
        Json(json!({ "m.upload.size": max }))
    } else {
        Json(json!({}))
    }
}

/// Create upload routes
pub fn upload_routes() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload))
        .route("/upload/{server_name}/{media_id}", put(upload_to))
        .route("/config", get(media_config))
}
