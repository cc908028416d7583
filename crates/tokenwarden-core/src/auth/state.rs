use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use super::token::{Token, TokenPair};
use super::AuthError;

/// The one session state of a `SessionManager`, shared by its components.
pub type SharedState = Arc<Mutex<SessionState>>;

/// A caller queued behind an in-flight refresh.
pub(crate) type Waiter = oneshot::Sender<Result<Token, AuthError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed, `initialize()` not called yet
    Uninitialized,
    /// Loading tokens from storage
    Restoring,
    /// Tokens present in memory
    Active,
    /// Signed out or nothing to restore
    Cleared,
}

/// Last verdict from the verify endpoint, bound to the token it checked.
#[derive(Debug, Clone)]
pub struct ServerValidation {
    pub token: Token,
    pub valid: bool,
    pub checked_at: Instant,
}

/// In-memory authoritative session snapshot.
///
/// Fields are crate-private: only the refresh coordinator, the sign-in and
/// sign-out paths and the reconciler's restore path write them. Invariant:
/// `waiters` is empty whenever `is_refreshing` is false.
#[derive(Debug)]
pub struct SessionState {
    pub(crate) access: Option<Token>,
    pub(crate) refresh: Option<Token>,
    pub(crate) is_refreshing: bool,
    pub(crate) is_signing_out: bool,
    pub(crate) waiters: Vec<Waiter>,
    pub(crate) last_server_validation: Option<ServerValidation>,
    pub(crate) consecutive_auth_failures: u32,
    pub(crate) last_failure_at: Option<Instant>,
    pub(crate) phase: SessionPhase,
    /// Bumped on every sign-in and sign-out; a refresh started in an older
    /// epoch must not write its result.
    pub(crate) epoch: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            access: None,
            refresh: None,
            is_refreshing: false,
            is_signing_out: false,
            waiters: Vec::new(),
            last_server_validation: None,
            consecutive_auth_failures: 0,
            last_failure_at: None,
            phase: SessionPhase::Uninitialized,
            epoch: 0,
        }
    }
}

impl SessionState {
    pub fn new_shared() -> SharedState {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn access(&self) -> Option<&Token> {
        self.access.as_ref()
    }

    pub fn refresh(&self) -> Option<&Token> {
        self.refresh.as_ref()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_refreshing(&self) -> bool {
        self.is_refreshing
    }

    pub fn is_signing_out(&self) -> bool {
        self.is_signing_out
    }

    pub fn consecutive_auth_failures(&self) -> u32 {
        self.consecutive_auth_failures
    }

    pub fn has_tokens(&self) -> bool {
        self.access.is_some() || self.refresh.is_some()
    }

    pub fn pair(&self) -> Option<TokenPair> {
        match (&self.access, &self.refresh) {
            (Some(access), Some(refresh)) => Some(TokenPair::new(access.clone(), refresh.clone())),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            access: self.access.clone(),
            refresh: self.refresh.clone(),
            phase: self.phase,
            is_refreshing: self.is_refreshing,
            is_signing_out: self.is_signing_out,
            waiting: self.waiters.len(),
            consecutive_auth_failures: self.consecutive_auth_failures,
        }
    }

    /// Start a new session with a fresh pair. Clears the signing-out latch.
    pub(crate) fn install_pair(&mut self, access: Option<Token>, refresh: Option<Token>) {
        self.access = access;
        self.refresh = refresh;
        self.is_signing_out = false;
        self.last_server_validation = None;
        self.reset_failures();
        self.phase = if self.has_tokens() {
            SessionPhase::Active
        } else {
            SessionPhase::Cleared
        };
        self.epoch += 1;
    }

    /// Drop both tokens and per-session bookkeeping. The signing-out latch
    /// is left to the caller.
    pub(crate) fn clear(&mut self) {
        self.access = None;
        self.refresh = None;
        self.last_server_validation = None;
        self.reset_failures();
        self.phase = SessionPhase::Cleared;
        self.epoch += 1;
    }

    pub(crate) fn reset_failures(&mut self) {
        self.consecutive_auth_failures = 0;
        self.last_failure_at = None;
    }

    /// Leave the refreshing state, handing back whoever queued up.
    pub(crate) fn finish_refresh(&mut self) -> Vec<Waiter> {
        self.is_refreshing = false;
        std::mem::take(&mut self.waiters)
    }
}

/// Read-only copy of the state for callers outside the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub access: Option<Token>,
    pub refresh: Option<Token>,
    pub phase: SessionPhase,
    pub is_refreshing: bool,
    pub is_signing_out: bool,
    pub waiting: usize,
    pub consecutive_auth_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::mint_token;

    #[test]
    fn test_default_state_is_uninitialized() {
        let state = SessionState::default();
        assert_eq!(state.phase(), SessionPhase::Uninitialized);
        assert!(!state.has_tokens());
        assert!(!state.is_refreshing());
    }

    #[test]
    fn test_install_pair_clears_latch_and_bumps_epoch() {
        let mut state = SessionState {
            is_signing_out: true,
            consecutive_auth_failures: 2,
            ..Default::default()
        };
        state.install_pair(Some(mint_token(300)), Some(mint_token(3600)));
        assert_eq!(state.phase(), SessionPhase::Active);
        assert!(!state.is_signing_out());
        assert_eq!(state.consecutive_auth_failures(), 0);
        assert_eq!(state.epoch, 1);
        assert!(state.pair().is_some());
    }

    #[test]
    fn test_clear_keeps_latch() {
        let mut state = SessionState::default();
        state.install_pair(Some(mint_token(300)), Some(mint_token(3600)));
        state.is_signing_out = true;
        state.clear();
        assert_eq!(state.phase(), SessionPhase::Cleared);
        assert!(state.is_signing_out());
        assert!(state.access().is_none() && state.refresh().is_none());
        assert_eq!(state.epoch, 2);
    }

    #[test]
    fn test_finish_refresh_drains_waiters() {
        let mut state = SessionState {
            is_refreshing: true,
            ..Default::default()
        };
        let (tx, _rx) = oneshot::channel();
        state.waiters.push(tx);
        let drained = state.finish_refresh();
        assert_eq!(drained.len(), 1);
        assert!(!state.is_refreshing());
        assert!(state.waiters.is_empty());
    }
}
