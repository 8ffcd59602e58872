//! HTTP request handlers for the media store.
//!
//! This module contains all endpoint handlers organized by functionality:
//! - `upload`: Uploads and upload limits
//! - `download`: Serves originals and thumbnails
//! - `search`: Searches the caller's media
//! - `health`: Health check endpoints

pub mod download;
pub mod health;
pub mod search;
pub mod upload;

pub use download::download_routes;
pub use health::health_routes;
pub use search::search_routes;
pub use upload::upload_routes;

use axum::Router;

use crate::state::AppState;

/// All routes under `/_matrix/media/v3`
pub fn media_routes() -> Router<AppState> {
    Router::new()
        .merge(upload_routes())
        .merge(download_routes())
        .merge(search_routes())
}
