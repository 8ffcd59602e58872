//! Access token authentication.
//!
//! Handlers that need an uploader take an [`AuthenticatedUser`] argument.
//! Tokens are mapped to Matrix user IDs in the `[auth] access_tokens` table.
//!
//! # Authentication Methods
//!
//! The extractor accepts an access token via:
//! 1. `Authorization: Bearer <token>` header
//! 2. `X-Access-Token: <token>` header
//! 3. `?access_token=<token>` query parameter
//!
//! # Example
//!
//! ```rust,ignore
//! async fn upload(user: AuthenticatedUser, State(state): State<AppState>) -> Result<...> {
//!     let owner = user.user_id;
//!     // ...
//! }
//! ```

use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::state::AppState;

/// The authenticated principal of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Matrix user ID, e.g. `@alice:example.org`
    pub user_id: String,
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let path = parts.uri.path().to_string();

        let Some(token) = extract_access_token(parts) else {
            warn!(path = %path, "Missing access token");
            return Err(AppError::MissingToken("Missing access token".to_string()));
        };

        match state.owner_for_token(&token) {
            Some(user_id) => {
                debug!(path = %path, user_id = %user_id, "Access token accepted");
                Ok(Self {
                    user_id: user_id.to_string(),
                })
            }
            None => {
                warn!(path = %path, "Unknown access token");
                Err(AppError::unauthorized("Unrecognised access token"))
            }
        }
    }
}

/// Extract an access token from request parts
fn extract_access_token(parts: &Parts) -> Option<String> {
    // Try Authorization: Bearer header
    if let Some(auth_header) = parts.headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    // Try X-Access-Token header
    if let Some(header) = parts.headers.get("x-access-token") {
        if let Ok(token) = header.to_str() {
            return Some(token.to_string());
        }
    }

    // Try query parameter
    if let Some(query) = parts.uri.query() {
        for param in query.split('&') {
            if let Some(token) = param.strip_prefix("access_token=") {
                return urlencoding::decode(token).ok().map(|t| t.into_owned());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[test]
    fn test_bearer_header() {
        let p = parts(
            Request::builder()
                .header("Authorization", "Bearer secret123")
                .body(())
                .unwrap(),
        );
        assert_eq!(extract_access_token(&p).as_deref(), Some("secret123"));
    }

    #[test]
    fn test_custom_header() {
        let p = parts(
            Request::builder()
                .header("X-Access-Token", "abc")
                .body(())
                .unwrap(),
        );
        assert_eq!(extract_access_token(&p).as_deref(), Some("abc"));
    }

    #[test]
    fn test_query_parameter() {
        let p = parts(
            Request::builder()
                .uri("/upload?filename=a.png&access_token=tok%2B1")
                .body(())
                .unwrap(),
        );
        assert_eq!(extract_access_token(&p).as_deref(), Some("tok+1"));
    }

    #[test]
    fn test_no_token() {
        let p = parts(Request::builder().uri("/upload").body(()).unwrap());
        assert!(extract_access_token(&p).is_none());

        let basic = parts(
            Request::builder()
                .header("Authorization", "Basic dXNlcjpwYXNz")
                .body(())
                .unwrap(),
        );
        assert!(extract_access_token(&basic).is_none());
    }
}
