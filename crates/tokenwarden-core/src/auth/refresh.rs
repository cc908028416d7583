//! Single-flight token refresh.
//!
//! At most one refresh call is in flight per session. The first caller to
//! find the session idle becomes the leader and talks to the backend; every
//! caller arriving while that call is pending queues a oneshot sender on the
//! shared state and receives the leader's outcome, bounded by the waiter
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthBackend, RefreshResponse};
use crate::events::SignOutReason;
use crate::storage::{self, TokenStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};

use super::signout::SignOutService;
use super::state::{SessionPhase, SessionState, SharedState};
use super::token::Token;
use super::validity::{ValidityOracle, ValidityVerdict};
use super::AuthError;

enum Role {
    Leader { epoch: u64, refresh: Token },
    Follower(oneshot::Receiver<Result<Token, AuthError>>),
}

/// Resets the refreshing flag if the leader's future is dropped mid-call, so
/// queued callers are released instead of waiting out their timeout.
struct RefreshGuard {
    state: SharedState,
    armed: bool,
}

impl RefreshGuard {
    /// Hand the outcome to queued callers. Called with the state lock held,
    /// in the same critical section that installs the result.
    fn complete(mut self, state: &mut SessionState, result: &Result<Token, AuthError>) {
        let waiters = state.finish_refresh();
        self.armed = false;
        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), ok = result.is_ok(), "Resolving queued refresh callers");
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

fn abandon(state: &mut SessionState) {
    for waiter in state.finish_refresh() {
        let _ = waiter.send(Err(AuthError::RefreshAbandoned));
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Refresh abandoned before completion");
        if let Ok(mut state) = self.state.try_lock() {
            abandon(&mut state);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let state = Arc::clone(&self.state);
            handle.spawn(async move {
                abandon(&mut *state.lock().await);
            });
        }
    }
}

/// Terminal refresh failures that end the session outright.
fn sign_out_reason(err: &AuthError) -> Option<SignOutReason> {
    match err {
        AuthError::RefreshTokenExpired => Some(SignOutReason::RefreshTokenExpired),
        AuthError::MalformedToken(_) => Some(SignOutReason::MalformedToken),
        _ => None,
    }
}

pub struct RefreshCoordinator {
    state: SharedState,
    store: Arc<dyn TokenStore>,
    backend: Arc<dyn AuthBackend>,
    oracle: Arc<ValidityOracle>,
    signout: Arc<SignOutService>,
    waiter_timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        state: SharedState,
        store: Arc<dyn TokenStore>,
        backend: Arc<dyn AuthBackend>,
        oracle: Arc<ValidityOracle>,
        signout: Arc<SignOutService>,
        waiter_timeout: Duration,
    ) -> Self {
        Self {
            state,
            store,
            backend,
            oracle,
            signout,
            waiter_timeout,
        }
    }

    /// Drop both tokens from memory and storage without signing out.
    fn purge(&self, state: &mut SessionState) {
        state.clear();
        if let Err(e) = storage::clear_pair(self.store.as_ref()) {
            warn!(error = %e, "Failed to purge stored tokens");
        }
    }

    /// Obtain a new access token, sharing an in-flight refresh if there is
    /// one. Any failure purges the session's tokens.
    pub async fn refresh(&self) -> Result<Token, AuthError> {
        let role = {
            let mut state = self.state.lock().await;
            if state.is_signing_out {
                return Err(AuthError::SigningOut);
            }
            if state.is_refreshing {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Role::Follower(rx)
            } else {
                let refresh = match state.refresh.clone() {
                    Some(token) => token,
                    None => return Err(AuthError::MissingRefreshToken),
                };
                match self.oracle.classify(&refresh) {
                    ValidityVerdict::Expired => {
                        info!("Refresh token expired, cannot refresh");
                        self.purge(&mut state);
                        return Err(AuthError::RefreshTokenExpired);
                    }
                    ValidityVerdict::Unparseable => {
                        warn!("Refresh token unreadable, purging");
                        self.purge(&mut state);
                        return Err(AuthError::MalformedToken("refresh token".into()));
                    }
                    ValidityVerdict::Valid | ValidityVerdict::NeedsProactiveRefresh => {}
                }
                state.is_refreshing = true;
                state.waiters.clear();
                Role::Leader {
                    epoch: state.epoch,
                    refresh,
                }
            }
        };

        match role {
            Role::Follower(rx) => match tokio::time::timeout(self.waiter_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AuthError::RefreshAbandoned),
                Err(_) => {
                    warn!(timeout_ms = self.waiter_timeout.as_millis() as u64, "Gave up waiting for in-flight refresh");
                    Err(AuthError::RefreshInFlightTimeout)
                }
            },
            Role::Leader { epoch, refresh } => {
                let guard = RefreshGuard {
                    state: Arc::clone(&self.state),
                    armed: true,
                };
                debug!("Refreshing access token");
                let response = self.backend.refresh(refresh.as_str()).await;
                self.apply(guard, epoch, response).await
            }
        }
    }

    async fn apply(
        &self,
        guard: RefreshGuard,
        epoch: u64,
        response: Result<RefreshResponse, ApiError>,
    ) -> Result<Token, AuthError> {
        let parsed = response
            .map_err(AuthError::from_refresh_failure)
            .and_then(|r| {
                let access = Token::parse(r.access)?;
                let rotated = r.refresh.map(Token::parse).transpose()?;
                Ok((access, rotated))
            });

        let mut state = self.state.lock().await;
        let result = self.install(&mut state, epoch, parsed);
        guard.complete(&mut state, &result);
        result
    }

    fn install(
        &self,
        state: &mut SessionState,
        epoch: u64,
        parsed: Result<(Token, Option<Token>), AuthError>,
    ) -> Result<Token, AuthError> {
        if state.epoch != epoch {
            // Signed out (or in again) while the call was pending.
            warn!("Session changed during refresh, discarding result");
            return Err(AuthError::SigningOut);
        }

        match parsed {
            Ok((access, rotated)) => {
                if let Err(e) = self.store.set(ACCESS_TOKEN_KEY, access.as_str()) {
                    warn!(error = %e, "Failed to persist refreshed access token");
                }
                if let Some(refresh) = &rotated {
                    if let Err(e) = self.store.set(REFRESH_TOKEN_KEY, refresh.as_str()) {
                        warn!(error = %e, "Failed to persist rotated refresh token");
                    }
                }
                info!(rotated = rotated.is_some(), "Access token refreshed");
                state.access = Some(access.clone());
                if let Some(refresh) = rotated {
                    state.refresh = Some(refresh);
                }
                state.last_server_validation = None;
                state.phase = SessionPhase::Active;
                Ok(access)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, purging tokens");
                self.purge(state);
                Err(e)
            }
        }
    }

    /// Token to attach to an outgoing request, refreshing when needed.
    /// `None` means the request goes out unauthenticated.
    pub async fn access_token(&self) -> Option<Token> {
        let (access, has_refresh) = {
            let mut state = self.state.lock().await;
            if state.is_signing_out {
                return None;
            }
            let access = match state.access.clone() {
                Some(token) if !token.is_well_formed() => {
                    warn!("Stored access token is malformed, discarding");
                    state.access = None;
                    if let Err(e) = self.store.remove(ACCESS_TOKEN_KEY) {
                        warn!(error = %e, "Failed to remove malformed access token");
                    }
                    None
                }
                other => other,
            };
            (access, state.refresh.is_some())
        };

        if let Some(current) = access {
            match self.oracle.classify(&current) {
                ValidityVerdict::Valid => return Some(current),
                ValidityVerdict::NeedsProactiveRefresh => {
                    return match self.refresh().await {
                        Ok(fresh) => Some(fresh),
                        Err(e) => {
                            debug!(error = %e, "Proactive refresh failed, using current token");
                            Some(current)
                        }
                    };
                }
                ValidityVerdict::Expired | ValidityVerdict::Unparseable => {}
            }
        }

        if !has_refresh {
            return None;
        }

        match self.refresh().await {
            Ok(fresh) => Some(fresh),
            Err(e) => {
                if let Some(reason) = sign_out_reason(&e) {
                    self.signout.force(reason).await;
                } else {
                    debug!(error = %e, "No access token available");
                }
                None
            }
        }
    }
}
