use thiserror::Error;

use crate::api::ApiError;

/// Failures of the session lifecycle.
///
/// `Clone` because a single refresh outcome is fanned out to every caller
/// queued behind it; transport details are carried as text for that reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Refresh token expired")]
    RefreshTokenExpired,

    #[error("Timed out waiting for in-flight refresh")]
    RefreshInFlightTimeout,

    #[error("In-flight refresh was abandoned")]
    RefreshAbandoned,

    #[error("Refresh rejected by server: {0}")]
    RefreshRejected(String),

    #[error("Too many consecutive authorization failures")]
    TooManyAuthFailures,

    #[error("Session is signing out")]
    SigningOut,

    #[error("Failed to load user profile: {0}")]
    Profile(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl AuthError {
    /// Classify a backend failure seen while refreshing. The refresh
    /// endpoint answers 400 for a blacklisted or garbled token, so that
    /// counts as a rejection too.
    pub fn from_refresh_failure(err: ApiError) -> Self {
        if err.is_auth_failure() || matches!(err, ApiError::InvalidRequest(_)) {
            AuthError::RefreshRejected(err.to_string())
        } else {
            AuthError::Network(err.to_string())
        }
    }

    /// Terminal errors end the session: the user has to sign in again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshTokenExpired
                | AuthError::MissingRefreshToken
                | AuthError::TooManyAuthFailures
        )
    }
}
