//! Media search handler.
//!
//! - `GET /_matrix/media/v3/search?q=&page=&limit=` - Search the caller's uploads

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::middleware::AuthenticatedUser;
use crate::models::MediaInfoResponse;
use crate::services::database::DEFAULT_SEARCH_LIMIT;
use crate::services::SearchQuery;
use crate::state::AppState;

/// Search query parameters
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    /// Zero-based
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One page of results
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<MediaInfoResponse>,
    pub page: usize,
    pub limit: usize,
    pub has_more: bool,
}

/// Search the caller's media, newest first
///
/// GET /_matrix/media/v3/search
async fn search(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>> {
    let query = SearchQuery::new(user.user_id, params.q)
        .with_page(params.page, params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT));
    let (page, limit) = (query.page, query.limit);

    let result = state.db.search_page(query)?;

    Ok(Json(SearchResponse {
        results: result
            .items
            .iter()
            .map(MediaInfoResponse::from_metadata)
            .collect(),
        page,
        limit,
        has_more: result.has_more,
    }))
}

/// Create search routes
pub fn search_routes() -> Router<AppState> {
    Router::new().route("/search", get(search))
}
