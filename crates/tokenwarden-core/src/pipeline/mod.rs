//! Outbound/inbound hooks for the API client layer.
//!
//! `attach_auth` puts a bearer token on a request; `handle_response`
//! inspects the result and runs at most one refresh-and-replay cycle on a
//! 401, guarded by the consecutive-failure breaker. `execute` chains the two
//! around `reqwest::Client::execute`.

pub mod breaker;
pub mod policy;

use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::auth::{AuthError, RefreshCoordinator, SharedState, SignOutService, Token};
use crate::events::SignOutReason;

pub use breaker::{AuthFailureBreaker, BreakerDecision};
pub use policy::{EndpointClass, EndpointPolicy};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl PipelineError {
    fn network(err: reqwest::Error) -> Self {
        PipelineError::Api(ApiError::NetworkError(err))
    }
}

/// A request on its way out, plus whether it is already a replay.
pub struct OutboundRequest {
    request: Request,
    retried: bool,
}

impl OutboundRequest {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            retried: false,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    fn set_bearer(&mut self, token: &Token) -> Result<(), PipelineError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
            .map_err(|_| ApiError::InvalidRequest("token is not a valid header value".into()))?;
        value.set_sensitive(true);
        self.request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }

    /// Split into the request to send and the record `handle_response`
    /// needs. The record holds a copy for replay when the body is clonable.
    pub fn dispatch(self) -> (Request, Dispatched) {
        let dispatched = Dispatched {
            path: self.request.url().path().to_string(),
            retried: self.retried,
            replay: self.request.try_clone(),
        };
        (self.request, dispatched)
    }
}

/// What the pipeline remembers about a request that has been sent.
pub struct Dispatched {
    path: String,
    retried: bool,
    replay: Option<Request>,
}

impl Dispatched {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn can_replay(&self) -> bool {
        self.replay.is_some()
    }
}

pub struct RequestPipeline {
    client: Client,
    base_url: String,
    base_path: String,
    policy: EndpointPolicy,
    breaker: AuthFailureBreaker,
    state: SharedState,
    coordinator: Arc<RefreshCoordinator>,
    signout: Arc<SignOutService>,
}

impl RequestPipeline {
    pub fn new(
        client: Client,
        base_url: &str,
        policy: EndpointPolicy,
        breaker: AuthFailureBreaker,
        state: SharedState,
        coordinator: Arc<RefreshCoordinator>,
        signout: Arc<SignOutService>,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let base_path = reqwest::Url::parse(&base_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        Self {
            client,
            base_url,
            base_path,
            policy,
            breaker,
            state,
            coordinator,
            signout,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Absolute URL for an API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn classify(&self, url_path: &str) -> EndpointClass {
        let relative = url_path.strip_prefix(&self.base_path).unwrap_or(url_path);
        self.policy.classify(relative)
    }

    /// Attach a bearer token unless the endpoint is public. Without a usable
    /// token the request goes out bare and the server decides.
    pub async fn attach_auth(&self, outbound: &mut OutboundRequest) -> Result<(), PipelineError> {
        let class = self.classify(outbound.request.url().path());
        if class == EndpointClass::Public {
            return Ok(());
        }
        match self.coordinator.access_token().await {
            Some(token) => outbound.set_bearer(&token),
            None => {
                debug!(path = outbound.request.url().path(), "No access token, sending unauthenticated");
                Ok(())
            }
        }
    }

    /// Inspect a response. A 401 on a protected endpoint counts against the
    /// breaker and, below the limit, triggers one refresh and replay.
    pub async fn handle_response(
        &self,
        sent: Dispatched,
        result: Result<Response, reqwest::Error>,
    ) -> Result<Response, PipelineError> {
        let response = result.map_err(PipelineError::network)?;
        let class = self.classify(&sent.path);
        let status = response.status();

        if status.is_success() {
            if class != EndpointClass::Public {
                self.breaker.record_success(&mut *self.state.lock().await);
            }
            return Ok(response);
        }
        if status != StatusCode::UNAUTHORIZED || class != EndpointClass::Protected {
            return Ok(response);
        }
        if sent.retried {
            debug!(path = %sent.path, "Replayed request still unauthorized");
            return Err(ApiError::Unauthorized.into());
        }

        let (decision, exhausted) = {
            let mut state = self.state.lock().await;
            if state.is_signing_out {
                return Err(AuthError::SigningOut.into());
            }
            let decision = self.breaker.record_failure(&mut state, Instant::now());
            (decision, self.breaker.exhausted(&state))
        };

        if decision == BreakerDecision::Trip {
            warn!(path = %sent.path, max = self.breaker.max_retries(), "Auth failure limit reached");
            self.signout.force(SignOutReason::TooManyAuthFailures).await;
            return Err(AuthError::TooManyAuthFailures.into());
        }

        debug!(path = %sent.path, "Unauthorized, refreshing and replaying");
        let token = match self.coordinator.refresh().await {
            Ok(token) => token,
            Err(e) => return Err(self.on_refresh_failure(e, exhausted).await),
        };

        let Some(replay) = sent.replay else {
            debug!(path = %sent.path, "Request body not replayable");
            return Err(ApiError::Unauthorized.into());
        };
        let mut outbound = OutboundRequest {
            request: replay,
            retried: true,
        };
        outbound.set_bearer(&token)?;

        let response = self
            .client
            .execute(outbound.request)
            .await
            .map_err(PipelineError::network)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized.into());
        }
        if response.status().is_success() {
            self.breaker.record_success(&mut *self.state.lock().await);
        }
        Ok(response)
    }

    /// `exhausted` is read before the refresh, which clears the counters
    /// when it fails.
    async fn on_refresh_failure(&self, err: AuthError, exhausted: bool) -> PipelineError {
        let reason = match &err {
            AuthError::RefreshTokenExpired => Some(SignOutReason::RefreshTokenExpired),
            AuthError::MalformedToken(_) => Some(SignOutReason::MalformedToken),
            AuthError::MissingRefreshToken | AuthError::RefreshRejected(_) => {
                exhausted.then_some(SignOutReason::RefreshFailed)
            }
            _ => None,
        };
        match reason {
            Some(reason) => {
                self.signout.force(reason).await;
            }
            None => debug!(error = %err, "Refresh after 401 failed"),
        }
        err.into()
    }

    /// Attach, send and handle in one call.
    pub async fn execute(&self, request: Request) -> Result<Response, PipelineError> {
        let mut outbound = OutboundRequest::new(request);
        self.attach_auth(&mut outbound).await?;
        let (request, sent) = outbound.dispatch();
        let result = self.client.execute(request).await;
        self.handle_response(sent, result).await
    }
}
