//! HTTP implementation of the authentication backend.
//!
//! This module provides the `HttpAuthBackend` struct for calling the token
//! endpoints (obtain, refresh, verify) and the profile endpoint.

use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use reqwest::{header, Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::UserProfile;

use super::{ApiError, AuthBackend, RefreshResponse};

// ============================================================================
// Constants
// ============================================================================

/// Obtain a token pair from credentials
pub const OBTAIN_PATH: &str = "/token/";

/// Rotate the access token using the refresh token
pub const REFRESH_PATH: &str = "/token/refresh/";

/// Server-side token verification
pub const VERIFY_PATH: &str = "/token/verify/";

/// Profile of the token's owner
pub const PROFILE_PATH: &str = "/users/me/";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct ObtainRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

/// Token pair as returned by the obtain endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ObtainResponse {
    pub access: String,
    pub refresh: String,
}

/// Backend client for the token and profile endpoints.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    base_url: String,
}

impl HttpAuthBackend {
    /// Create a new backend client with the default request timeout
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Build a backend that shares an existing connection pool.
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange credentials for a token pair.
    pub async fn obtain_tokens(
        &self,
        username: &str,
        password: &str,
    ) -> Result<ObtainResponse, ApiError> {
        debug!(username, "Requesting token pair");
        self.post_json(OBTAIN_PATH, &ObtainRequest { username, password })
            .await
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .header(header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{path}: {e}")))
    }

    async fn do_refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        self.post_json(REFRESH_PATH, &RefreshRequest { refresh: refresh_token })
            .await
    }

    async fn do_verify(&self, token: &str) -> Result<bool, ApiError> {
        let response = self
            .client
            .post(self.endpoint(VERIFY_PATH))
            .header(header::ACCEPT, "application/json")
            .json(&VerifyRequest { token })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST => {
                debug!(status = %response.status(), "Server rejected token");
                Ok(false)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(%status, "Unexpected status from verify endpoint");
                Err(ApiError::from_status(status, &body))
            }
        }
    }

    async fn do_fetch_profile(&self, access_token: &str) -> Result<UserProfile, ApiError> {
        let response = self
            .client
            .get(self.endpoint(PROFILE_PATH))
            .bearer_auth(access_token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{PROFILE_PATH}: {e}")))
    }
}

impl AuthBackend for HttpAuthBackend {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<RefreshResponse, ApiError>> {
        Box::pin(self.do_refresh(refresh_token))
    }

    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<bool, ApiError>> {
        Box::pin(self.do_verify(token))
    }

    fn fetch_profile<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, Result<UserProfile, ApiError>> {
        Box::pin(self.do_fetch_profile(access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let backend = HttpAuthBackend::new("https://api.example.com/api/").expect("client");
        assert_eq!(
            backend.endpoint(REFRESH_PATH),
            "https://api.example.com/api/token/refresh/"
        );
        assert_eq!(backend.base_url(), "https://api.example.com/api");
    }

    #[test]
    fn test_refresh_response_without_rotation() {
        let resp: RefreshResponse =
            serde_json::from_str(r#"{"access": "a.b.c"}"#).expect("parse refresh response");
        assert_eq!(resp.access, "a.b.c");
        assert!(resp.refresh.is_none());
    }
}
