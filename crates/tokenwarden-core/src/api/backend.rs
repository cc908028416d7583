use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::models::UserProfile;

use super::ApiError;

/// Body returned by the refresh endpoint. A missing `refresh` means the
/// server did not rotate the refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

/// The backend calls the session core depends on.
///
/// `HttpAuthBackend` is the production implementation; tests substitute a
/// scripted fake so refresh counting and timing are deterministic.
pub trait AuthBackend: Send + Sync {
    /// `POST /token/refresh/` with the refresh token.
    fn refresh<'a>(&'a self, refresh_token: &'a str)
        -> BoxFuture<'a, Result<RefreshResponse, ApiError>>;

    /// `POST /token/verify/`. `Ok(false)` is a definitive "invalid" from the
    /// server; transport or server failures are errors, not verdicts.
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<bool, ApiError>>;

    /// `GET /users/me/` with the access token.
    fn fetch_profile<'a>(&'a self, access_token: &'a str)
        -> BoxFuture<'a, Result<UserProfile, ApiError>>;
}
