//! Auth state notifications.
//!
//! Listeners register a callback and get a `Subscription` back; dropping the
//! handle (or calling `unsubscribe`) removes the listener. Each event is
//! delivered at most once to every listener registered at emit time, with no
//! replay for late subscribers. A panicking listener is logged and does not
//! stop delivery to the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignOutReason {
    UserInitiated,
    TooManyAuthFailures,
    RefreshFailed,
    RefreshTokenExpired,
    StateInconsistencyNoTokens,
    StateInconsistencyExpiredTokens,
    MalformedToken,
}

impl SignOutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignOutReason::UserInitiated => "user_initiated",
            SignOutReason::TooManyAuthFailures => "too_many_auth_failures",
            SignOutReason::RefreshFailed => "refresh_failed",
            SignOutReason::RefreshTokenExpired => "refresh_token_expired",
            SignOutReason::StateInconsistencyNoTokens => "state_inconsistency_no_tokens",
            SignOutReason::StateInconsistencyExpiredTokens => "state_inconsistency_expired_tokens",
            SignOutReason::MalformedToken => "malformed_token",
        }
    }

    pub fn is_user_initiated(&self) -> bool {
        matches!(self, SignOutReason::UserInitiated)
    }
}

impl std::fmt::Display for SignOutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventKind {
    /// The session was torn down because of a failure
    ForceSignOut,
    /// The user signed out
    SignedOut,
}

/// Immutable notification. Fields are only readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthEvent {
    kind: AuthEventKind,
    reason: SignOutReason,
    timestamp: DateTime<Utc>,
}

impl AuthEvent {
    pub fn sign_out(reason: SignOutReason) -> Self {
        let kind = if reason.is_user_initiated() {
            AuthEventKind::SignedOut
        } else {
            AuthEventKind::ForceSignOut
        };
        Self {
            kind,
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> AuthEventKind {
        self.kind
    }

    pub fn reason(&self) -> SignOutReason {
        self.reason
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

type Callback = Arc<dyn Fn(&AuthEvent) + Send + Sync>;
type Entries = Mutex<Vec<(u64, Callback)>>;

fn lock(entries: &Entries) -> MutexGuard<'_, Vec<(u64, Callback)>> {
    // A listener never runs under this lock, so poisoning carries no torn state.
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registered auth listeners.
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    entries: Arc<Entries>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((id, Arc::new(callback)));
        Subscription {
            id,
            entries: Arc::downgrade(&self.entries),
            active: true,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every current listener. Returns how many returned
    /// normally.
    pub fn emit(&self, event: &AuthEvent) -> usize {
        let callbacks: Vec<Callback> = lock(&self.entries)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        let mut delivered = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(reason = %event.reason(), "Auth listener panicked"),
            }
        }
        debug!(reason = %event.reason(), delivered, "Auth event emitted");
        delivered
    }
}

/// Handle returned by `Listeners::subscribe`.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    entries: Weak<Entries>,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the listener registered for the lifetime of the session.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(entries) = self.entries.upgrade() {
            lock(&entries).retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}
