//! The UI layer's view of the session.
//!
//! `UiBinding` publishes the "signed in" flag the UI renders from; the
//! reconciler compares it with the real token state. `Navigator` is how the
//! core sends the user back to the sign-in surface.

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::models::UserRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UiAuthState {
    pub signed_in: bool,
    pub role: Option<UserRole>,
}

/// Sender side of the UI-visible sign-in flag.
pub struct UiBinding {
    tx: watch::Sender<UiAuthState>,
}

impl UiBinding {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(UiAuthState::default());
        Self { tx }
    }

    pub fn current(&self) -> UiAuthState {
        *self.tx.borrow()
    }

    pub fn is_signed_in(&self) -> bool {
        self.tx.borrow().signed_in
    }

    pub fn subscribe(&self) -> watch::Receiver<UiAuthState> {
        self.tx.subscribe()
    }

    pub fn mark_signed_in(&self, role: UserRole) {
        self.set(UiAuthState {
            signed_in: true,
            role: Some(role),
        });
    }

    pub fn mark_signed_out(&self) {
        self.set(UiAuthState::default());
    }

    /// Only notifies receivers on an actual change, so redundant marks do
    /// not retrigger the reconciler.
    fn set(&self, next: UiAuthState) {
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

impl Default for UiBinding {
    fn default() -> Self {
        Self::new()
    }
}

/// Moves the user to the sign-in surface.
pub trait Navigator: Send + Sync {
    fn to_sign_in(&self);
}

/// Default navigator for headless use: records the request in the log.
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn to_sign_in(&self) {
        info!("Navigating to sign-in");
    }
}
