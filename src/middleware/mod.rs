//! Request middleware and extractors.
//!
//! - `auth`: access token authentication

pub mod auth;

pub use auth::AuthenticatedUser;
